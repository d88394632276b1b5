use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Environment variable pointing at the settings file.
pub const CONFIG_PATH_ENV: &str = "VMGRID_CONFIG";

/// Default settings file, looked up relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "vmgrid.toml";

/// Hub configuration.
///
/// Values are read once at startup from a TOML file and do not change while
/// the server runs. Every section has working defaults so the hub can boot
/// without a settings file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub dirs: DirSettings,
    pub kvm: KvmSettings,
    pub openstack: OpenstackSettings,
    pub pool: PoolSettings,
    pub session: SessionSettings,
    pub net: NetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// The address to listen on.
    pub listen: String,
    /// Upper bound on worker threads handling requests.
    pub thread_pool_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Path to the SQLite database file.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirSettings {
    /// Screenshots land in `<screenshots_dir>/<session>/<logstep>.png`.
    pub screenshots_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmSettings {
    pub enabled: bool,
    pub max_vm_count: usize,
    /// Platform name to warm VM count.
    pub preloaded: HashMap<String, usize>,
    /// Clone drives are created here.
    pub clones_dir: String,
    /// One subdirectory per origin image.
    pub origins_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenstackSettings {
    pub enabled: bool,
    pub max_vm_count: usize,
    pub preloaded: HashMap<String, usize>,
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub tenant_name: String,
    /// Availability zone servers are booted into.
    pub zone: String,
    /// Only Glance images with this name prefix become platforms.
    pub platform_name_prefix: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Seconds between preloader passes.
    pub preloader_frequency: u64,
    /// Enables the background health checker.
    pub vm_check: bool,
    /// Seconds between health check passes.
    pub vm_check_frequency: u64,
    /// Seconds between activation polls during VM creation.
    pub vm_create_check_pause: u64,
    /// Activation polls before creation is declared failed.
    pub vm_create_check_attempts: u32,
    /// Seconds a session request may wait for a VM before failing.
    pub get_vm_timeout: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds of client inactivity before a session is reaped.
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    /// Selenium server port inside each VM.
    pub selenium_port: u16,
    /// Screenshot agent port inside each VM.
    pub agent_port: u16,
    /// Seconds a liveness probe may take before giving up.
    pub ping_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            dirs: DirSettings::default(),
            kvm: KvmSettings::default(),
            openstack: OpenstackSettings::default(),
            pool: PoolSettings::default(),
            session: SessionSettings::default(),
            net: NetSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9000".to_string(),
            thread_pool_max: 100,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "vmgrid.db".to_string(),
        }
    }
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            screenshots_dir: "screenshots".to_string(),
        }
    }
}

impl Default for KvmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_vm_count: 2,
            preloaded: HashMap::new(),
            clones_dir: "clones".to_string(),
            origins_dir: "origins".to_string(),
        }
    }
}

impl Default for OpenstackSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_vm_count: 2,
            preloaded: HashMap::new(),
            auth_url: "http://localhost:5000/v2.0".to_string(),
            username: String::new(),
            password: String::new(),
            tenant_name: String::new(),
            zone: "nova".to_string(),
            platform_name_prefix: "origin_".to_string(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            preloader_frequency: 3,
            vm_check: false,
            vm_check_frequency: 1800,
            vm_create_check_pause: 5,
            vm_create_check_attempts: 1000,
            get_vm_timeout: 180,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { timeout: 360 }
    }
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            selenium_port: 4455,
            agent_port: 9000,
            ping_timeout: 180,
        }
    }
}

impl Settings {
    /// Load settings from `VMGRID_CONFIG`, falling back to `vmgrid.toml` in
    /// the working directory, falling back to defaults if neither exists.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path),
            Err(_) => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load_from_file(default)
                } else {
                    log::info!("no settings file found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load settings from an explicit file path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.kvm.enabled && !self.openstack.enabled {
            return Err(Error::Invalid(
                "at least one provider must be enabled".to_string(),
            ));
        }

        let capacity = self.capacity();
        if capacity == 0 {
            return Err(Error::Invalid(
                "total VM capacity is zero".to_string(),
            ));
        }

        let preloaded: usize = self
            .enabled_preloaded()
            .values()
            .sum();
        if preloaded > capacity {
            return Err(Error::Invalid(format!(
                "preloaded VM count ({preloaded}) exceeds capacity ({capacity})"
            )));
        }

        if self.pool.preloader_frequency == 0 {
            return Err(Error::Invalid(
                "pool.preloader_frequency must be non-zero".to_string(),
            ));
        }

        if self.session.timeout == 0 {
            return Err(Error::Invalid(
                "session.timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Global VM capacity: the sum of enabled provider caps.
    pub fn capacity(&self) -> usize {
        let mut capacity = 0;
        if self.kvm.enabled {
            capacity += self.kvm.max_vm_count;
        }
        if self.openstack.enabled {
            capacity += self.openstack.max_vm_count;
        }
        capacity
    }

    /// Merged preload targets across enabled providers.
    pub fn enabled_preloaded(&self) -> HashMap<String, usize> {
        let mut merged = HashMap::new();
        if self.kvm.enabled {
            merged.extend(self.kvm.preloaded.clone());
        }
        if self.openstack.enabled {
            merged.extend(self.openstack.preloaded.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.net.selenium_port, 4455);
        assert_eq!(settings.capacity(), 2);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
listen = "127.0.0.1:9999"

[openstack]
enabled = true
max_vm_count = 4

[openstack.preloaded]
origin_1 = 2

[pool]
get_vm_timeout = 30
"#
        )
        .unwrap();

        let settings = Settings::load_from_file(file.path()).unwrap();
        assert_eq!(settings.server.listen, "127.0.0.1:9999");
        assert!(settings.openstack.enabled);
        assert_eq!(settings.capacity(), 2 + 4);
        assert_eq!(settings.enabled_preloaded().get("origin_1"), Some(&2));
        assert_eq!(settings.pool.get_vm_timeout, 30);
        // untouched section keeps its default
        assert_eq!(settings.session.timeout, 360);
    }

    #[test]
    fn rejects_no_providers() {
        let mut settings = Settings::default();
        settings.kvm.enabled = false;
        settings.openstack.enabled = false;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_overcommitted_preload() {
        let mut settings = Settings::default();
        settings.kvm.max_vm_count = 1;
        settings.kvm.preloaded.insert("ubuntu".to_string(), 5);
        assert!(settings.validate().is_err());
    }
}
