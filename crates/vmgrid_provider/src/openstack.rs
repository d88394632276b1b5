//! OpenStack adapter: boots servers from Glance images through Nova and
//! resolves tenant networking through Neutron. All API traffic is JSON over
//! the service catalog endpoints obtained at Keystone authentication.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use vmgrid_settings::OpenstackSettings;

use crate::ping::ping_vm;
use crate::{Activation, CloneDriver, Platform, Provider, ProviderError, Result};

pub struct OpenstackProvider {
    settings: OpenstackSettings,
    api: Arc<OpenstackApi>,
    selenium_port: u16,
    create_check_pause: Duration,
    create_check_attempts: u32,
}

impl OpenstackProvider {
    pub fn new(
        settings: OpenstackSettings,
        selenium_port: u16,
        create_check_pause: Duration,
        create_check_attempts: u32,
    ) -> Self {
        let api = Arc::new(OpenstackApi::new(settings.clone()));
        Self {
            settings,
            api,
            selenium_port,
            create_check_pause,
            create_check_attempts,
        }
    }
}

#[async_trait]
impl Provider for OpenstackProvider {
    fn name(&self) -> &'static str {
        "openstack"
    }

    fn max_vm_count(&self) -> usize {
        self.settings.max_vm_count
    }

    fn preloaded(&self) -> &HashMap<String, usize> {
        &self.settings.preloaded
    }

    async fn discover_platforms(&self) -> Result<Vec<Platform>> {
        let images = self.api.list_images().await?;
        let platforms = images
            .into_iter()
            .filter(|name| name.starts_with(&self.settings.platform_name_prefix))
            .map(|name| Platform {
                name,
                node: self.settings.zone.clone(),
            })
            .collect();
        Ok(platforms)
    }

    fn make_clone(&self, platform: &Platform, name: &str) -> Arc<dyn CloneDriver> {
        Arc::new(OpenstackClone {
            name: name.to_string(),
            platform: platform.name.clone(),
            zone: self.settings.zone.clone(),
            api: self.api.clone(),
            server_id: Mutex::new(None),
            selenium_port: self.selenium_port,
            create_check_pause: self.create_check_pause,
            create_check_attempts: self.create_check_attempts,
        })
    }
}

pub struct OpenstackClone {
    name: String,
    platform: String,
    zone: String,
    api: Arc<OpenstackApi>,
    server_id: Mutex<Option<String>>,
    selenium_port: u16,
    create_check_pause: Duration,
    create_check_attempts: u32,
}

impl OpenstackClone {
    fn server_id(&self) -> Option<String> {
        self.server_id.lock().clone()
    }

    fn require_server_id(&self) -> Result<String> {
        self.server_id()
            .ok_or_else(|| ProviderError::Api(format!("{}: server never booted", self.name)))
    }

    /// Poll Nova until the server reports ACTIVE. ERROR is terminal.
    async fn wait_for_activated_service(&self) -> Result<()> {
        let id = self.require_server_id()?;
        for _ in 0..self.create_check_attempts {
            let server = self.api.get_server(&id).await?;
            match server["status"].as_str().unwrap_or_default() {
                "ACTIVE" => return Ok(()),
                "ERROR" => {
                    return Err(ProviderError::NotActivated(format!(
                        "{}: server entered ERROR state",
                        self.name
                    )))
                }
                other => log::debug!("{}: status {other}", self.name),
            }
            tokio::time::sleep(self.create_check_pause).await;
        }
        Err(ProviderError::NotActivated(format!(
            "{}: never reached ACTIVE",
            self.name
        )))
    }

    /// Activation failed. Decide between delete and salvage: a server the
    /// provider has no record of is unrecoverable; an up server whose
    /// service answers is kept; anything else gets one rebuild.
    async fn recover(&self, cause: ProviderError) -> Result<Activation> {
        if !self.has_created().await.unwrap_or(false) {
            self.delete().await?;
            return Err(cause);
        }

        if self.exists().await.unwrap_or(false) {
            if let Ok(ip) = self.get_ip().await {
                let deadline =
                    self.create_check_pause * self.create_check_attempts.max(1);
                if ping_vm(ip, self.selenium_port, deadline).await {
                    log::warn!("{}: salvaged after activation error: {cause}", self.name);
                    return self.activation().await;
                }
            }
        }

        log::warn!("{}: rebuilding after activation error: {cause}", self.name);
        self.rebuild().await
    }

    async fn activation(&self) -> Result<Activation> {
        let id = self.require_server_id()?;
        let server = self.api.get_server(&id).await?;
        let (ip, mac) = self.api.tenant_address(&server).await?;
        Ok(Activation { ip, mac })
    }

    async fn wait_and_probe(&self) -> Result<Activation> {
        self.wait_for_activated_service().await?;

        let activation = self.activation().await?;
        let deadline = self.create_check_pause * self.create_check_attempts.max(1);
        if !ping_vm(activation.ip, self.selenium_port, deadline).await {
            return Err(ProviderError::NotActivated(format!(
                "{}: {}:{} never answered",
                self.name, activation.ip, self.selenium_port
            )));
        }
        Ok(activation)
    }
}

#[async_trait]
impl CloneDriver for OpenstackClone {
    async fn create(&self) -> Result<Activation> {
        log::info!(
            "booting openstack server {} from {}",
            self.name,
            self.platform
        );

        let image_id = self.api.find_image(&self.platform).await?;
        let flavor_id = self.api.default_flavor().await?;
        let id = self
            .api
            .boot_server(&self.name, &image_id, &flavor_id, &self.zone)
            .await?;
        *self.server_id.lock() = Some(id);

        match self.wait_and_probe().await {
            Ok(activation) => {
                log::info!("openstack server {} active at {}", self.name, activation.ip);
                Ok(activation)
            }
            Err(e) => self.recover(e).await,
        }
    }

    async fn delete(&self) -> Result<()> {
        let id = { self.server_id.lock().take() };
        let Some(id) = id else {
            return Ok(());
        };
        self.api.delete_server(&id).await
    }

    async fn rebuild(&self) -> Result<Activation> {
        let id = self.require_server_id()?;
        let image_id = self.api.find_image(&self.platform).await?;
        self.api.rebuild_server(&id, &image_id).await?;
        self.wait_and_probe().await
    }

    async fn has_created(&self) -> Result<bool> {
        let Some(id) = self.server_id() else {
            return Ok(false);
        };
        Ok(self.api.get_server(&id).await.is_ok())
    }

    async fn exists(&self) -> Result<bool> {
        let Some(id) = self.server_id() else {
            return Ok(false);
        };
        match self.api.get_server(&id).await {
            Ok(server) => Ok(server["status"].as_str() == Some("ACTIVE")),
            Err(_) => Ok(false),
        }
    }

    async fn get_ip(&self) -> Result<IpAddr> {
        let activation = self.activation().await?;
        Ok(activation.ip)
    }
}

struct AuthState {
    token: String,
    nova: String,
    neutron: String,
    glance: String,
}

/// Minimal Keystone v2 / Nova / Neutron / Glance client.
pub struct OpenstackApi {
    http: reqwest::Client,
    settings: OpenstackSettings,
    auth: tokio::sync::Mutex<Option<Arc<AuthState>>>,
}

impl OpenstackApi {
    fn new(settings: OpenstackSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            auth: tokio::sync::Mutex::new(None),
        }
    }

    async fn auth_state(&self) -> Result<Arc<AuthState>> {
        let mut guard = self.auth.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }

        let body = json!({
            "auth": {
                "tenantName": self.settings.tenant_name,
                "passwordCredentials": {
                    "username": self.settings.username,
                    "password": self.settings.password,
                }
            }
        });
        let url = format!("{}/tokens", self.settings.auth_url.trim_end_matches('/'));
        let reply: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = reply["access"]["token"]["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Api("keystone reply carries no token".to_string()))?
            .to_string();

        let catalog = reply["access"]["serviceCatalog"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let endpoint = |service: &str| -> Result<String> {
            catalog
                .iter()
                .find(|entry| entry["type"].as_str() == Some(service))
                .and_then(|entry| entry["endpoints"][0]["publicURL"].as_str())
                .map(|url| url.trim_end_matches('/').to_string())
                .ok_or_else(|| {
                    ProviderError::Api(format!("service catalog has no {service} endpoint"))
                })
        };

        let state = Arc::new(AuthState {
            token,
            nova: endpoint("compute")?,
            neutron: endpoint("network")?,
            glance: endpoint("image")?,
        });
        *guard = Some(state.clone());
        Ok(state)
    }

    async fn drop_auth(&self) {
        *self.auth.lock().await = None;
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Value> {
        for attempt in 0..2 {
            let state = self.auth_state().await?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-Auth-Token", &state.token);
            if let Some(body) = &body {
                request = request.json(body);
            }
            let reply = request.send().await?;

            // Token expired: drop the cached auth and retry once.
            if reply.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.drop_auth().await;
                continue;
            }

            let status = reply.status();
            if !status.is_success() {
                let text = reply.text().await.unwrap_or_default();
                return Err(ProviderError::Api(format!("{method} {url}: {status}: {text}")));
            }
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return Ok(reply.json().await.unwrap_or(Value::Null));
        }
        unreachable!("auth retry loop returns on second pass")
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let state = self.auth_state().await?;
        let reply = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2/images", state.glance),
                None,
            )
            .await?;
        Ok(reply["images"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|image| image["name"].as_str().map(str::to_string))
            .collect())
    }

    async fn find_image(&self, name: &str) -> Result<String> {
        let state = self.auth_state().await?;
        let reply = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2/images?name={name}", state.glance),
                None,
            )
            .await?;
        reply["images"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|image| image["name"].as_str() == Some(name))
            .and_then(|image| image["id"].as_str().map(str::to_string))
            .ok_or_else(|| ProviderError::Api(format!("image {name} not found")))
    }

    async fn default_flavor(&self) -> Result<String> {
        let state = self.auth_state().await?;
        let reply = self
            .request(
                reqwest::Method::GET,
                format!("{}/flavors", state.nova),
                None,
            )
            .await?;
        reply["flavors"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api("no flavors available".to_string()))
    }

    async fn boot_server(
        &self,
        name: &str,
        image_id: &str,
        flavor_id: &str,
        zone: &str,
    ) -> Result<String> {
        let state = self.auth_state().await?;
        let body = json!({
            "server": {
                "name": name,
                "imageRef": image_id,
                "flavorRef": flavor_id,
                "availability_zone": zone,
            }
        });
        let reply = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers", state.nova),
                Some(body),
            )
            .await?;
        reply["server"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api("boot reply carries no server id".to_string()))
    }

    async fn get_server(&self, id: &str) -> Result<Value> {
        let state = self.auth_state().await?;
        let reply = self
            .request(
                reqwest::Method::GET,
                format!("{}/servers/{id}", state.nova),
                None,
            )
            .await?;
        Ok(reply["server"].clone())
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        let state = self.auth_state().await?;
        match self
            .request(
                reqwest::Method::DELETE,
                format!("{}/servers/{id}", state.nova),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            // Idempotent delete: a missing server is already gone.
            Err(ProviderError::Api(message)) if message.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rebuild_server(&self, id: &str, image_id: &str) -> Result<()> {
        let state = self.auth_state().await?;
        let body = json!({ "rebuild": { "imageRef": image_id } });
        self.request(
            reqwest::Method::POST,
            format!("{}/servers/{id}/action", state.nova),
            Some(body),
        )
        .await?;
        Ok(())
    }

    /// Resolve the tenant network's address for a server: match the local
    /// CIDR against Neutron's subnets, name the network by id, then read
    /// that network's entry from the server's address map.
    async fn tenant_address(&self, server: &Value) -> Result<(IpAddr, Option<String>)> {
        let addresses = &server["addresses"];
        let map = addresses
            .as_object()
            .ok_or_else(|| ProviderError::Api("server has no addresses".to_string()))?;

        let network_name = match self.tenant_network_name().await {
            Ok(name) => Some(name),
            Err(e) => {
                log::debug!("tenant network resolution failed: {e}");
                None
            }
        };

        let entry = network_name
            .as_deref()
            .and_then(|name| map.get(name))
            .or_else(|| map.values().next())
            .and_then(|list| list.as_array())
            .and_then(|list| list.first())
            .ok_or_else(|| ProviderError::Api("server has no usable address".to_string()))?;

        let ip = entry["addr"]
            .as_str()
            .and_then(|addr| addr.parse().ok())
            .ok_or_else(|| ProviderError::Api("unparseable server address".to_string()))?;
        let mac = entry["OS-EXT-IPS-MAC:mac_addr"]
            .as_str()
            .map(str::to_string);
        Ok((ip, mac))
    }

    async fn tenant_network_name(&self) -> Result<String> {
        let local = local_ipv4()?;
        let state = self.auth_state().await?;

        let subnets = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2.0/subnets", state.neutron),
                None,
            )
            .await?;
        let network_id = subnets["subnets"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|subnet| {
                subnet["cidr"]
                    .as_str()
                    .map(|cidr| cidr_contains(cidr, local))
                    .unwrap_or(false)
            })
            .and_then(|subnet| subnet["network_id"].as_str().map(str::to_string))
            .ok_or_else(|| {
                ProviderError::Api(format!("no subnet matches local address {local}"))
            })?;

        let network = self
            .request(
                reqwest::Method::GET,
                format!("{}/v2.0/networks/{network_id}", state.neutron),
                None,
            )
            .await?;
        network["network"]["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Api(format!("network {network_id} has no name")))
    }
}

/// The host's outbound IPv4 address, without sending traffic.
fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(ProviderError::Api(format!(
            "expected an IPv4 local address, got {ip}"
        ))),
    }
}

fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    let Some((base, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let (Ok(base), Ok(prefix)) = (base.parse::<Ipv4Addr>(), prefix.parse::<u32>()) else {
        return false;
    };
    if prefix > 32 {
        return false;
    }
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    (u32::from(base) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_containment() {
        let ip: Ipv4Addr = "10.20.30.40".parse().unwrap();
        assert!(cidr_contains("10.20.30.0/24", ip));
        assert!(cidr_contains("10.20.0.0/16", ip));
        assert!(cidr_contains("0.0.0.0/0", ip));
        assert!(!cidr_contains("10.20.31.0/24", ip));
        assert!(!cidr_contains("not-a-cidr", ip));
        assert!(!cidr_contains("10.20.30.0/40", ip));
    }

    #[test]
    fn tenant_address_falls_back_to_first_network() {
        let server = json!({
            "addresses": {
                "private": [
                    { "addr": "192.168.0.5", "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01" }
                ]
            }
        });
        let map = server["addresses"].as_object().unwrap();
        let entry = map.values().next().unwrap().as_array().unwrap();
        assert_eq!(entry[0]["addr"].as_str(), Some("192.168.0.5"));
    }
}
