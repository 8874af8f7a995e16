//! The `Modem` aggregate: identity, configuration, registration, and
//! bearer state tracked across one modem's lifetime. The Modem FSM and
//! SIM FSM both mutate this through a shared handle; the lifecycle
//! façade reads it for status snapshots.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use crate::codec::dms::OperatingMode;
use crate::codec::nas::Rat;
use crate::codec::wds::PdpType;
use crate::transport::DeviceHandle;

/// SIM readiness as exposed to callers; mirrors the QMI UIM PIN/UPIN
/// state machine without its transient sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Unknown,
    PinRequired,
    PukRequired,
    Ready,
    Blocked,
}

/// User-supplied fields that drive configuration and unlock.
#[derive(Debug, Clone, Default)]
pub struct ModemConfig {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pin: Option<String>,
    pub puk: Option<String>,
    pub roaming: bool,
    pub pdp_type: PdpType,
    /// Skips the kernel link-layer reconfiguration step entirely, for
    /// devices already wired raw-ip at the driver level.
    pub skip_configuration: bool,
}

impl Default for PdpType {
    fn default() -> Self {
        PdpType::Ipv4
    }
}

/// Strings read off the modem itself during bring-up.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub imei: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
}

/// Network registration state as last reported by NAS.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub rat: Option<Rat>,
    pub mcc: Option<u16>,
    pub mnc: Option<u16>,
    pub mnc_len: u8,
    pub operator_name: Option<String>,
    pub cs_attached: bool,
    pub ps_attached: bool,
}

/// Live packet-data bearer state, populated once `START_IFACE` succeeds.
#[derive(Debug, Clone, Default)]
pub struct Bearer {
    pub packet_data_handle: Option<u32>,
    pub pdp_type: Option<PdpType>,
    pub v4_addr: Option<Ipv4Addr>,
    pub v4_mask: Option<Ipv4Addr>,
    pub v4_gateway: Option<Ipv4Addr>,
    pub v6_addr: Option<(Ipv6Addr, u8)>,
    pub dns1: Option<std::net::IpAddr>,
    pub dns2: Option<std::net::IpAddr>,
}

/// Kernel network-interface side of the modem: which netdev it surfaces
/// as and how its link-layer framing is set up.
#[derive(Debug, Clone, Default)]
pub struct NetifConfig {
    pub kernel_device: Option<String>,
    pub raw_ip: bool,
    pub pass_through: bool,
}

/// SIM-related substate the SIM FSM maintains on behalf of the Modem.
#[derive(Debug, Clone)]
pub struct SimSubstate {
    pub state: SimState,
    pub use_uim: bool,
    pub use_upin: bool,
    pub requires_unlock: bool,
    pub pin_retries: Option<u8>,
    pub puk_retries: Option<u8>,
}

impl Default for SimSubstate {
    fn default() -> Self {
        SimSubstate {
            state: SimState::Unknown,
            use_uim: true,
            use_upin: false,
            requires_unlock: false,
            pin_retries: None,
            puk_retries: None,
        }
    }
}

/// The aggregate shared by the Modem FSM, SIM FSM, and the lifecycle
/// façade for one named modem. Wrapped in `Arc<Mutex<..>>` so the FSM
/// tasks and the façade's status reads never race — the FSMs themselves
/// remain single-owner, cooperative tasks; only the snapshot surface is
/// shared.
pub struct Modem {
    pub name: String,
    pub device_path: String,
    pub identity: Identity,
    pub config: ModemConfig,
    pub registration: Registration,
    pub bearer: Bearer,
    pub netif: NetifConfig,
    pub sim: SimSubstate,
    pub last_error: Option<String>,
    pub device: DeviceHandle,
}

impl Modem {
    pub fn new(name: String, device_path: String, device: DeviceHandle) -> Arc<Mutex<Modem>> {
        Arc::new(Mutex::new(Modem {
            name,
            device_path,
            identity: Identity::default(),
            config: ModemConfig::default(),
            registration: Registration::default(),
            bearer: Bearer::default(),
            netif: NetifConfig::default(),
            sim: SimSubstate::default(),
            last_error: None,
            device,
        }))
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(modem = %self.name, error = %msg, "modem entered an error state");
        self.last_error = Some(msg);
    }
}

/// Snapshot of every `Modem` field, returned by the lifecycle façade's
/// `dump`. Plain data, no handles — safe to hand across an RPC boundary.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ModemSnapshot {
    pub name: String,
    pub device_path: String,
    pub imei: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub apn: Option<String>,
    pub roaming: bool,
    pub sim_state: String,
    pub operator_name: Option<String>,
    pub mcc: Option<u16>,
    pub mnc: Option<u16>,
    pub mnc_len: u8,
    pub cs_attached: bool,
    pub ps_attached: bool,
    pub packet_data_handle: Option<u32>,
    pub v4_addr: Option<String>,
    pub v4_gateway: Option<String>,
    pub last_error: Option<String>,
}

impl From<&Modem> for ModemSnapshot {
    fn from(m: &Modem) -> Self {
        ModemSnapshot {
            name: m.name.clone(),
            device_path: m.device_path.clone(),
            imei: m.identity.imei.clone(),
            manufacturer: m.identity.manufacturer.clone(),
            model: m.identity.model.clone(),
            revision: m.identity.revision.clone(),
            imsi: m.identity.imsi.clone(),
            iccid: m.identity.iccid.clone(),
            apn: m.config.apn.clone(),
            roaming: m.config.roaming,
            sim_state: format!("{:?}", m.sim.state),
            operator_name: m.registration.operator_name.clone(),
            mcc: m.registration.mcc,
            mnc: m.registration.mnc,
            mnc_len: m.registration.mnc_len,
            cs_attached: m.registration.cs_attached,
            ps_attached: m.registration.ps_attached,
            packet_data_handle: m.bearer.packet_data_handle,
            v4_addr: m.bearer.v4_addr.map(|a| a.to_string()),
            v4_gateway: m.bearer.v4_gateway.map(|a| a.to_string()),
            last_error: m.last_error.clone(),
        }
    }
}

/// External operating-mode vocabulary, exposed by `get_operating_mode`.
/// A thin re-export of the DMS wire enum under the lifecycle façade's
/// own name, matching the QMI spec's eight defined modes.
pub type OperatingModeStatus = OperatingMode;
