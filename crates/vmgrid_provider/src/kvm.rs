//! KVM adapter: clones qcow2 origin drives and drives libvirt through
//! `virsh`. Origins are directories under `origins_dir`, one per platform,
//! each holding a `drive.qcow2`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use vmgrid_settings::KvmSettings;

use crate::ping::ping_vm;
use crate::{Activation, CloneDriver, Platform, Provider, ProviderError, Result};

/// Drive file expected inside every origin directory.
const ORIGIN_DRIVE: &str = "drive.qcow2";

/// Libvirt network clones attach to.
const NETWORK: &str = "default";

pub struct KvmProvider {
    settings: KvmSettings,
    selenium_port: u16,
    create_check_pause: Duration,
    create_check_attempts: u32,
}

impl KvmProvider {
    pub fn new(
        settings: KvmSettings,
        selenium_port: u16,
        create_check_pause: Duration,
        create_check_attempts: u32,
    ) -> Self {
        Self {
            settings,
            selenium_port,
            create_check_pause,
            create_check_attempts,
        }
    }
}

#[async_trait]
impl Provider for KvmProvider {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn max_vm_count(&self) -> usize {
        self.settings.max_vm_count
    }

    fn preloaded(&self) -> &HashMap<String, usize> {
        &self.settings.preloaded
    }

    async fn discover_platforms(&self) -> Result<Vec<Platform>> {
        let origins = PathBuf::from(&self.settings.origins_dir);
        let mut platforms = Vec::new();

        let mut entries = tokio::fs::read_dir(&origins).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(ORIGIN_DRIVE).exists() {
                log::warn!("origin {:?} has no {ORIGIN_DRIVE}, skipping", path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            platforms.push(Platform {
                name,
                node: self.name().to_string(),
            });
        }

        Ok(platforms)
    }

    fn make_clone(&self, platform: &Platform, name: &str) -> Arc<dyn CloneDriver> {
        Arc::new(KvmClone {
            name: name.to_string(),
            platform: platform.name.clone(),
            clones_dir: PathBuf::from(&self.settings.clones_dir),
            origins_dir: PathBuf::from(&self.settings.origins_dir),
            mac: mac_for(name),
            selenium_port: self.selenium_port,
            create_check_pause: self.create_check_pause,
            create_check_attempts: self.create_check_attempts,
        })
    }
}

pub struct KvmClone {
    name: String,
    platform: String,
    clones_dir: PathBuf,
    origins_dir: PathBuf,
    mac: String,
    selenium_port: u16,
    create_check_pause: Duration,
    create_check_attempts: u32,
}

impl KvmClone {
    fn drive_path(&self) -> PathBuf {
        self.clones_dir.join(format!("{}.qcow2", self.name))
    }

    fn dumpxml_path(&self) -> PathBuf {
        self.clones_dir.join(format!("{}.xml", self.name))
    }

    fn origin_drive(&self) -> PathBuf {
        self.origins_dir.join(&self.platform).join(ORIGIN_DRIVE)
    }

    async fn clone_drive(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.clones_dir).await?;
        run(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-b",
                &self.origin_drive().to_string_lossy(),
                &self.drive_path().to_string_lossy(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn define_and_start(&self) -> Result<()> {
        let xml = domain_xml(&self.name, &self.drive_path(), &self.mac);
        tokio::fs::write(self.dumpxml_path(), xml).await?;
        // Transient domain: gone from libvirt once destroyed.
        run("virsh", &["create", &self.dumpxml_path().to_string_lossy()]).await?;
        Ok(())
    }

    async fn wait_for_ip(&self) -> Result<IpAddr> {
        for _ in 0..self.create_check_attempts {
            if let Some(ip) = self.lease_ip().await? {
                return Ok(ip);
            }
            tokio::time::sleep(self.create_check_pause).await;
        }
        Err(ProviderError::NotActivated(format!(
            "{}: no DHCP lease for {}",
            self.name, self.mac
        )))
    }

    async fn lease_ip(&self) -> Result<Option<IpAddr>> {
        let output = run("virsh", &["net-dhcp-leases", NETWORK]).await?;
        Ok(lease_ip_for_mac(&output, &self.mac))
    }

    async fn wait_for_activated_service(&self, ip: IpAddr) -> Result<()> {
        let deadline =
            self.create_check_pause * self.create_check_attempts.max(1);
        if ping_vm(ip, self.selenium_port, deadline).await {
            Ok(())
        } else {
            Err(ProviderError::NotActivated(format!(
                "{}: {ip}:{} never answered",
                self.name, self.selenium_port
            )))
        }
    }
}

#[async_trait]
impl CloneDriver for KvmClone {
    async fn create(&self) -> Result<Activation> {
        log::info!("creating kvm clone {} from {}", self.name, self.platform);

        self.clone_drive().await?;
        self.define_and_start().await?;

        let ip = self.wait_for_ip().await?;
        self.wait_for_activated_service(ip).await?;

        log::info!("kvm clone {} active at {ip}", self.name);
        Ok(Activation {
            ip,
            mac: Some(self.mac.clone()),
        })
    }

    async fn delete(&self) -> Result<()> {
        // virsh fails on unknown or already-stopped domains; both are fine
        // here since delete must be callable at any point of the VM's life.
        if let Err(e) = run("virsh", &["destroy", &self.name]).await {
            log::debug!("virsh destroy {}: {e}", self.name);
        }

        for path in [self.drive_path(), self.dumpxml_path()] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    async fn rebuild(&self) -> Result<Activation> {
        log::info!("rebuilding kvm clone {}", self.name);
        self.delete().await?;
        self.create().await
    }

    async fn has_created(&self) -> Result<bool> {
        Ok(run("virsh", &["domid", &self.name]).await.is_ok())
    }

    async fn exists(&self) -> Result<bool> {
        match run("virsh", &["domstate", &self.name]).await {
            Ok(state) => Ok(state.trim() == "running"),
            Err(_) => Ok(false),
        }
    }

    async fn get_ip(&self) -> Result<IpAddr> {
        self.lease_ip().await?.ok_or_else(|| {
            ProviderError::Api(format!("{}: no DHCP lease for {}", self.name, self.mac))
        })
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(ProviderError::Command(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Stable locally-administered MAC in the QEMU OUI, derived from the clone
/// name so re-created domains keep their address.
fn mac_for(name: &str) -> String {
    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_DNS, name.as_bytes());
    let bytes = digest.as_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

fn domain_xml(name: &str, drive: &Path, mac: &str) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>2048</memory>
  <vcpu>2</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{drive}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <mac address='{mac}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' autoport='yes'/>
  </devices>
</domain>
"#,
        name = name,
        drive = drive.display(),
        network = NETWORK,
        mac = mac,
    )
}

/// Pull the IPv4 address for `mac` out of `virsh net-dhcp-leases` output.
fn lease_ip_for_mac(output: &str, mac: &str) -> Option<IpAddr> {
    for line in output.lines() {
        if !line.to_lowercase().contains(&mac.to_lowercase()) {
            continue;
        }
        for token in line.split_whitespace() {
            if let Some((addr, _prefix)) = token.split_once('/') {
                if let Ok(ip) = addr.parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }
    None
}
