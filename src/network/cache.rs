use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::domain::DomainInterface;
use crate::network::types::{PodCacheInterface, Vif};
use crate::paths;

/// On-disk mailbox between the two plug phases.
///
/// Phase 1 writes under the launcher PID, phase 2 reads under the literal
/// `"self"`; the deployment mounts make both resolve to the same files.
/// Every artifact is JSON, one file per interface, single writer.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(paths::cache_root())
    }
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn interface_path(&self, pid: &str, name: &str) -> PathBuf {
        self.root.join(pid).join(name).join("interface.json")
    }

    fn vif_path(&self, pid: &str, name: &str) -> PathBuf {
        self.root.join(pid).join(name).join("vif.json")
    }

    fn pod_interface_path(&self, uid: &str, name: &str) -> PathBuf {
        self.root
            .join("vmi-interfaces")
            .join(uid)
            .join(format!("{}.json", name))
    }

    fn dhcp_sentinel_path(&self, pod_interface_name: &str) -> PathBuf {
        self.root
            .join(format!("dhcp_started-{}", pod_interface_name))
    }

    pub async fn read_interface(&self, pid: &str, name: &str) -> Result<Option<DomainInterface>> {
        read_json(&self.interface_path(pid, name)).await
    }

    pub async fn write_interface(
        &self,
        pid: &str,
        name: &str,
        iface: &DomainInterface,
    ) -> Result<()> {
        write_json(&self.interface_path(pid, name), iface).await
    }

    pub async fn read_vif(&self, pid: &str, name: &str) -> Result<Option<Vif>> {
        read_json(&self.vif_path(pid, name)).await
    }

    pub async fn write_vif(&self, pid: &str, name: &str, vif: &Vif) -> Result<()> {
        write_json(&self.vif_path(pid, name), vif).await
    }

    pub async fn write_pod_interface(
        &self,
        uid: &str,
        name: &str,
        cache: &PodCacheInterface,
    ) -> Result<()> {
        write_json(&self.pod_interface_path(uid, name), cache).await
    }

    pub async fn read_pod_interface(
        &self,
        uid: &str,
        name: &str,
    ) -> Result<Option<PodCacheInterface>> {
        read_json(&self.pod_interface_path(uid, name)).await
    }

    /// Whether a DHCP server has already been started for this interface in
    /// some launcher incarnation.
    pub async fn dhcp_started(&self, pod_interface_name: &str) -> bool {
        fs::try_exists(self.dhcp_sentinel_path(pod_interface_name))
            .await
            .unwrap_or(false)
    }

    pub async fn mark_dhcp_started(&self, pod_interface_name: &str) -> Result<()> {
        let path = self.dhcp_sentinel_path(pod_interface_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, b"")
            .await
            .with_context(|| format!("failed to create dhcp started file {}", path.display()))
    }
}

/// Missing file reads as absent; an unreadable or unparsable file is an
/// error.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let buf = match fs::read(path).await {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value =
        serde_json::from_slice(&buf).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// 0644 write-to-temp-then-rename, so phase 2 never observes a torn file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let buf = serde_json::to_vec_pretty(value).context("serializing cache entry")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buf)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644))
        .await
        .with_context(|| format!("setting permissions on {}", tmp.display()))?;

    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}
