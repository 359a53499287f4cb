//! Per-device sysctl writes under `/proc/sys`

use ovnbgp_core::net::KernelFlag;
use ovnbgp_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes kernel flags below a proc root, `/proc/sys` in production
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new("/proc/sys")
    }
}

impl Sysctl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, flag: &KernelFlag) -> PathBuf {
        self.root.join(flag.proc_path())
    }

    pub async fn write(&self, flag: &KernelFlag, value: bool) -> Result<()> {
        let path = self.path(flag);
        let contents = if value { "1" } else { "0" };
        debug!("sysctl {}={}", flag.sysctl_key(), contents);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::kernel(format!("{}: {}", path.display(), e)))
    }

    pub async fn read(&self, flag: &KernelFlag) -> Result<bool> {
        let contents = tokio::fs::read_to_string(self.path(flag)).await?;
        Ok(contents.trim() == "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf_dir(root: &Path, family: &str, device: &str) {
        std::fs::create_dir_all(root.join(format!("net/{}/conf/{}", family, device))).unwrap();
    }

    #[tokio::test]
    async fn toggles_proxy_arp() {
        let dir = tempfile::tempdir().unwrap();
        conf_dir(dir.path(), "ipv4", "br-ex");
        let sysctl = Sysctl::new(dir.path());
        let flag = KernelFlag::ProxyArp("br-ex".into());

        sysctl.write(&flag, true).await.unwrap();
        assert!(sysctl.read(&flag).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("net/ipv4/conf/br-ex/proxy_arp")).unwrap(),
            "1"
        );

        sysctl.write(&flag, false).await.unwrap();
        assert!(!sysctl.read(&flag).await.unwrap());
    }

    #[tokio::test]
    async fn vlan_device_keeps_its_dot() {
        let dir = tempfile::tempdir().unwrap();
        conf_dir(dir.path(), "ipv6", "br-ex.100");
        let sysctl = Sysctl::new(dir.path());

        let flag = KernelFlag::ProxyNdp("br-ex.100".into());
        sysctl.write(&flag, true).await.unwrap();
        assert!(dir.path().join("net/ipv6/conf/br-ex.100/proxy_ndp").exists());
    }

    #[tokio::test]
    async fn missing_device_is_a_kernel_error() {
        let dir = tempfile::tempdir().unwrap();
        let sysctl = Sysctl::new(dir.path());
        let err = sysctl
            .write(&KernelFlag::ProxyArp("nope".into()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
    }
}
