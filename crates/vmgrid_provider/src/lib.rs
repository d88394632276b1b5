//! Provider interface the pool consumes, plus the KVM and OpenStack adapters.
//!
//! A [`Provider`] owns a class of machines: it knows its capacity, which
//! platforms (origin images) it can clone, and how to mint a [`CloneDriver`]
//! for one concrete VM. The driver carries all provider-specific state, so
//! the pool only ever sees the trait.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod kvm;
pub mod openstack;
pub mod ping;

pub use kvm::KvmProvider;
pub use openstack::OpenstackProvider;
pub use ping::ping_vm;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider api error: {0}")]
    Api(String),

    #[error("vm never activated: {0}")]
    NotActivated(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable descriptor of a source image, discovered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub name: String,
    /// Provider node or zone the image lives on.
    pub node: String,
}

/// What a successful activation reports back.
#[derive(Debug, Clone)]
pub struct Activation {
    pub ip: IpAddr,
    pub mac: Option<String>,
}

/// Control surface for one VM.
///
/// `create` provisions the machine and blocks until the guest service
/// answers its port, or fails. `delete` must stay safe to call at any point
/// of the VM's life, including when creation never finished.
#[async_trait]
pub trait CloneDriver: Send + Sync {
    /// Provision the VM and wait for the guest service to come up.
    async fn create(&self) -> Result<Activation>;

    /// Tear the VM down. Idempotent; safe if the VM never existed.
    async fn delete(&self) -> Result<()>;

    /// Destructive reset to the origin image, re-waiting for activation.
    async fn rebuild(&self) -> Result<Activation>;

    /// Whether the provider has any record of this VM.
    async fn has_created(&self) -> Result<bool>;

    /// Whether the VM exists and is up from the provider's point of view.
    async fn exists(&self) -> Result<bool>;

    /// Management IP from provider metadata.
    async fn get_ip(&self) -> Result<IpAddr>;
}

/// One backing infrastructure (KVM host, OpenStack tenant).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-provider VM cap; global capacity is the sum over providers.
    fn max_vm_count(&self) -> usize;

    /// Platform name to warm VM count, for the preloader.
    fn preloaded(&self) -> &HashMap<String, usize>;

    /// Enumerate the origin images this provider can clone.
    async fn discover_platforms(&self) -> Result<Vec<Platform>>;

    /// Mint a driver for one VM named `name`, cloned from `platform`.
    fn make_clone(&self, platform: &Platform, name: &str) -> Arc<dyn CloneDriver>;
}
