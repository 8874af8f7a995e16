//! Lifecycle façade (§4.6): the thin layer between an external RPC
//! binding and the per-modem FSM tasks. Owns the `name -> ModemHandle`
//! map and translates each call into either a direct `ModemHandle`
//! method or a `Modem` snapshot read, the same way the original's
//! `uqmid_modem_lookup` + dispatch functions front the osmocom FSM
//! instances.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;
use crate::modem::{Modem, ModemConfig, ModemSnapshot, OperatingModeStatus};
use crate::modem_fsm::{ModemFsm, ModemHandle};
use crate::netdev::{NetdevAdapter, SysfsNetdevAdapter};
use crate::transport::{Device, DeviceHandle, OpenError, TransportMode};

/// `qmi` talks raw QMUX directly; `mbim` tunnels it inside MBIM
/// Command/Command-Done envelopes (§3 MBIM tunneling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Qmi,
    Mbim,
}

impl From<DriverKind> for TransportMode {
    fn from(k: DriverKind) -> TransportMode {
        match k {
            DriverKind::Qmi => TransportMode::Raw,
            DriverKind::Mbim => TransportMode::Mbim,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("modem {0:?} already exists")]
    AlreadyExists(String),
    #[error("no such modem {0:?}")]
    NotFound(String),
    #[error("failed to open device: {0}")]
    Open(#[from] OpenError),
}

/// One named modem's FSM front plus the device handle it rides on, so
/// `remove_modem` can close the transport after asking the FSM to stop.
struct Entry {
    handle: ModemHandle,
    device: DeviceHandle,
}

/// Tracks every modem this daemon currently manages. Cheap to clone and
/// share across RPC connections — the map itself is behind an async
/// mutex since `add_modem`/`remove_modem` are infrequent compared to
/// the steady stream of per-modem FSM traffic they never touch.
#[derive(Clone)]
pub struct Lifecycle {
    clock: Arc<dyn Clock>,
    modems: Arc<AsyncMutex<HashMap<String, Entry>>>,
}

impl Lifecycle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Lifecycle { clock, modems: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    pub async fn add_modem(&self, name: &str, device_path: &str, driver: DriverKind) -> Result<(), LifecycleError> {
        let mut modems = self.modems.lock().await;
        if modems.contains_key(name) {
            return Err(LifecycleError::AlreadyExists(name.to_string()));
        }
        let device = Device::open(device_path, driver.into(), self.clock.clone()).await?;
        let modem = Modem::new(name.to_string(), device_path.to_string(), device.clone());
        let handle = ModemFsm::spawn(modem, device.clone(), self.clock.clone(), SysfsNetdevAdapter::default());
        handle.start();
        modems.insert(name.to_string(), Entry { handle, device });
        Ok(())
    }

    pub async fn remove_modem(&self, name: &str) -> Result<(), LifecycleError> {
        let mut modems = self.modems.lock().await;
        let entry = modems.remove(name).ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        entry.handle.destroy();
        Ok(())
    }

    pub async fn configure_modem(&self, name: &str, cfg: ModemConfig) -> Result<(), LifecycleError> {
        let modems = self.modems.lock().await;
        let entry = modems.get(name).ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        entry.handle.configure(cfg);
        Ok(())
    }

    pub async fn get_operating_mode(&self, name: &str) -> Result<OperatingModeStatus, LifecycleError> {
        let modems = self.modems.lock().await;
        let entry = modems.get(name).ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        let outcome = entry.device.request(crate::codec::dms::GetOperatingModeRequest).await;
        match outcome {
            Ok(crate::registry::RequestOutcome::Success(resp)) => Ok(resp.mode),
            _ => Ok(OperatingModeStatus::Offline),
        }
    }

    /// Returns the last NAS registration snapshot the Modem FSM cached;
    /// unlike `get_operating_mode` this never round-trips to the device,
    /// since `NETSEARCH`/`LIVE` already keep it current.
    pub async fn get_network_status(&self, name: &str) -> Result<crate::modem::Registration, LifecycleError> {
        let modems = self.modems.lock().await;
        let entry = modems.get(name).ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        let modem = entry.handle.modem.lock().unwrap();
        Ok(modem.registration.clone())
    }

    pub async fn dump(&self, name: &str) -> Result<ModemSnapshot, LifecycleError> {
        let modems = self.modems.lock().await;
        let entry = modems.get(name).ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        let modem = entry.handle.modem.lock().unwrap();
        Ok(ModemSnapshot::from(&*modem))
    }

    pub async fn list(&self) -> Vec<String> {
        self.modems.lock().await.keys().cloned().collect()
    }
}
