//! Kernel network-device adapter (§6): the small interface the Modem FSM
//! uses during `CONFIGURE_KERNEL` to put the WWAN netdev into raw-IP mode
//! and bring it up. Grounded in `original_source/uqmid/wwan.c`
//! (`wwan_refresh_device`, `wwan_read_configuration`,
//! `wwan_set_configuration`, `wwan_set_mtu`, `wwan_ifupdown`), which talks
//! to sysfs and an `ioctl` socket directly; this crate expresses the same
//! four operations as an `async_trait` so tests can swap in a fake.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetdevError {
    #[error("no network device found under {0}")]
    NotFound(String),
    #[error("netdev io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `raw_ip`/`pass_through` as read from or written to
/// `/sys/class/<subsystem>/<cdc>/device/net/<dev>/qmi/{raw_ip,pass_through}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkConfig {
    pub raw_ip: bool,
    pub pass_through: bool,
}

#[async_trait]
pub trait NetdevAdapter: Send + Sync {
    /// Locates the kernel netdev backing a `/dev/cdc-wdm*` character
    /// device, preferring the `usbmisc` class subsystem (kernel >= 3.6)
    /// and falling back to `usb`. Returns the netdev name and the sysfs
    /// directory holding its `qmi/` configuration knobs.
    async fn refresh_device(&self, cdc_path: &str) -> Result<(String, PathBuf), NetdevError>;

    async fn read_link_config(&self, sysfs_path: &PathBuf) -> Result<LinkConfig, NetdevError>;

    async fn set_link_config(&self, sysfs_path: &PathBuf, cfg: LinkConfig) -> Result<(), NetdevError>;

    async fn set_mtu(&self, netdev: &str, bytes: u32) -> Result<(), NetdevError>;

    async fn iface_updown(&self, netdev: &str, up: bool) -> Result<(), NetdevError>;
}

/// Production adapter: walks sysfs and shells out to `ip link` for the
/// MTU/updown steps rather than hand-rolling an `ioctl(SIOCSIFMTU)`
/// socket call, which is the more idiomatic choice in a Rust daemon that
/// already links `tokio::process` transitively through its runtime.
pub struct SysfsNetdevAdapter {
    sys_class_root: PathBuf,
}

impl Default for SysfsNetdevAdapter {
    fn default() -> Self {
        SysfsNetdevAdapter { sys_class_root: PathBuf::from("/sys/class") }
    }
}

impl SysfsNetdevAdapter {
    pub fn new(sys_class_root: impl Into<PathBuf>) -> Self {
        SysfsNetdevAdapter { sys_class_root: sys_class_root.into() }
    }

    fn cdc_basename(cdc_path: &str) -> String {
        cdc_path.rsplit('/').next().unwrap_or(cdc_path).to_string()
    }

    async fn first_netdev_under(&self, subsystem: &str, cdc_name: &str) -> Option<(String, PathBuf)> {
        let net_dir = self.sys_class_root.join(subsystem).join(cdc_name).join("device/net");
        let mut entries = tokio::fs::read_dir(&net_dir).await.ok()?;
        let entry = entries.next_entry().await.ok()??;
        let name = entry.file_name().to_string_lossy().into_owned();
        Some((name, net_dir))
    }
}

#[async_trait]
impl NetdevAdapter for SysfsNetdevAdapter {
    async fn refresh_device(&self, cdc_path: &str) -> Result<(String, PathBuf), NetdevError> {
        let cdc_name = Self::cdc_basename(cdc_path);
        if let Some((dev, net_dir)) = self.first_netdev_under("usbmisc", &cdc_name).await {
            return Ok((dev.clone(), net_dir.join(&dev)));
        }
        if let Some((dev, net_dir)) = self.first_netdev_under("usb", &cdc_name).await {
            return Ok((dev.clone(), net_dir.join(&dev)));
        }
        Err(NetdevError::NotFound(cdc_name))
    }

    async fn read_link_config(&self, sysfs_path: &PathBuf) -> Result<LinkConfig, NetdevError> {
        let qmi_dir = sysfs_path.join("qmi");
        let raw_ip = tokio::fs::read_to_string(qmi_dir.join("raw_ip")).await?.trim() == "Y";
        let pass_through = tokio::fs::read_to_string(qmi_dir.join("pass_through")).await?.trim() == "Y";
        Ok(LinkConfig { raw_ip, pass_through })
    }

    async fn set_link_config(&self, sysfs_path: &PathBuf, cfg: LinkConfig) -> Result<(), NetdevError> {
        let qmi_dir = sysfs_path.join("qmi");
        tokio::fs::write(qmi_dir.join("raw_ip"), if cfg.raw_ip { "Y" } else { "N" }).await?;
        tokio::fs::write(qmi_dir.join("pass_through"), if cfg.pass_through { "Y" } else { "N" }).await?;
        Ok(())
    }

    async fn set_mtu(&self, netdev: &str, bytes: u32) -> Result<(), NetdevError> {
        let status = tokio::process::Command::new("ip")
            .args(["link", "set", netdev, "mtu", &bytes.to_string()])
            .status()
            .await?;
        if !status.success() {
            return Err(NetdevError::Io(std::io::Error::other(format!("ip link set mtu exited with {status}"))));
        }
        Ok(())
    }

    async fn iface_updown(&self, netdev: &str, up: bool) -> Result<(), NetdevError> {
        let state = if up { "up" } else { "down" };
        let status = tokio::process::Command::new("ip").args(["link", "set", netdev, state]).status().await?;
        if !status.success() {
            return Err(NetdevError::Io(std::io::Error::other(format!("ip link set {state} exited with {status}"))));
        }
        Ok(())
    }
}

/// In-memory adapter for FSM tests: records every call and serves a
/// fixed netdev name, so the `CONFIGURE_KERNEL` state can be exercised
/// without a real WWAN interface.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NetdevCall {
        Refresh,
        ReadConfig,
        SetConfig(LinkConfig),
        SetMtu(u32),
        UpDown(bool),
    }

    pub struct FakeNetdevAdapter {
        pub netdev_name: String,
        pub calls: Mutex<Vec<NetdevCall>>,
    }

    impl Default for FakeNetdevAdapter {
        fn default() -> Self {
            FakeNetdevAdapter { netdev_name: "wwan0".to_string(), calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl NetdevAdapter for FakeNetdevAdapter {
        async fn refresh_device(&self, _cdc_path: &str) -> Result<(String, PathBuf), NetdevError> {
            self.calls.lock().unwrap().push(NetdevCall::Refresh);
            Ok((self.netdev_name.clone(), PathBuf::from(format!("/sys/class/usbmisc/{}", self.netdev_name))))
        }

        async fn read_link_config(&self, _sysfs_path: &PathBuf) -> Result<LinkConfig, NetdevError> {
            self.calls.lock().unwrap().push(NetdevCall::ReadConfig);
            Ok(LinkConfig::default())
        }

        async fn set_link_config(&self, _sysfs_path: &PathBuf, cfg: LinkConfig) -> Result<(), NetdevError> {
            self.calls.lock().unwrap().push(NetdevCall::SetConfig(cfg));
            Ok(())
        }

        async fn set_mtu(&self, _netdev: &str, bytes: u32) -> Result<(), NetdevError> {
            self.calls.lock().unwrap().push(NetdevCall::SetMtu(bytes));
            Ok(())
        }

        async fn iface_updown(&self, _netdev: &str, up: bool) -> Result<(), NetdevError> {
            self.calls.lock().unwrap().push(NetdevCall::UpDown(up));
            Ok(())
        }
    }
}
