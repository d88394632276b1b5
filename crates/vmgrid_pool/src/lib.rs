//! VM pool: ready/in-use bookkeeping, capacity admission, background
//! preloading and health checks.

use thiserror::Error;

mod checker;
mod clone;
mod pool;
mod preloader;

pub use checker::VmChecker;
pub use clone::{CloneVm, ONDEMAND_PREFIX, PRELOADED_PREFIX};
pub use pool::{Dest, PoolConfig, PoolInfo, VmPool, VmView};
pub use preloader::Preloader;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("maximum count of virtual machines already running")]
    CapacityExceeded,

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error(transparent)]
    Provider(#[from] vmgrid_provider::ProviderError),
}
