//! The Modem FSM (§4.4): drives one modem from cold attach to a live IP
//! bearer. States and transitions follow `original_source/uqmid/modem_fsm.c`
//! (`enum modem_fsm_state` in `modem_fsm.h`) one-for-one; this crate
//! expresses the osmocom event-table dispatch as a single linear `drive`
//! coroutine, the same shape `sim_fsm.rs` uses for its child FSM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::clock::Clock;
use crate::codec::dms::{self, OperatingMode};
use crate::codec::nas::{self, IndicationMask, RegistrationState};
use crate::codec::wds::{self, IpFamily};
use crate::codec::{ctl, wda};
use crate::modem::{Modem, ModemConfig, SimState};
use crate::netdev::NetdevAdapter;
use crate::registry::RequestOutcome;
use crate::sim_fsm::{SimFsm, SimOutcome};
use crate::transport::DeviceHandle;

/// How many consecutive `CALL_FAILED` responses `START_IFACE` retries
/// before giving up. Not bounded in the original (§9 Open Questions);
/// this crate fixes a finite cap so bring-up always terminates.
const START_IFACE_RETRY_CAP: u32 = 3;
const NETSEARCH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REGISTERED_SETTLE_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemFsmState {
    Idle,
    Resync,
    GetVersion,
    GetModel,
    Poweroff,
    WaitUim,
    ConfigureModem,
    ConfigureKernel,
    Poweron,
    Netsearch,
    Registered,
    StartIface,
    Live,
    Failed,
    Destroy,
}

pub enum ModemCommand {
    Start,
    Configure(ModemConfig),
    Destroy,
}

/// Cheap, cloneable front for the modem FSM actor; the lifecycle façade
/// holds one of these per named modem.
#[derive(Clone)]
pub struct ModemHandle {
    cmd_tx: mpsc::UnboundedSender<ModemCommand>,
    pub modem: Arc<Mutex<Modem>>,
}

impl ModemHandle {
    pub fn start(&self) {
        let _ = self.cmd_tx.send(ModemCommand::Start);
    }

    pub fn configure(&self, cfg: ModemConfig) {
        let _ = self.cmd_tx.send(ModemCommand::Configure(cfg));
    }

    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(ModemCommand::Destroy);
    }
}

/// Drives one modem. Owned entirely by its background task; everything
/// else reaches it through `ModemHandle`.
pub struct ModemFsm<N: NetdevAdapter> {
    modem: Arc<Mutex<Modem>>,
    device: DeviceHandle,
    clock: Arc<dyn Clock>,
    netdev: N,
    state: ModemFsmState,
    configured: AtomicBool,
    config_notify: Arc<Notify>,
}

enum Step<T> {
    Value(T),
    Destroyed,
}

impl<N: NetdevAdapter + 'static> ModemFsm<N> {
    pub fn spawn(modem: Arc<Mutex<Modem>>, device: DeviceHandle, clock: Arc<dyn Clock>, netdev: N) -> ModemHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let fsm = ModemFsm {
            modem: modem.clone(),
            device,
            clock,
            netdev,
            state: ModemFsmState::Idle,
            configured: AtomicBool::new(false),
            config_notify: Arc::new(Notify::new()),
        };
        tokio::spawn(fsm.run(rx));
        ModemHandle { cmd_tx: tx, modem }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ModemCommand>) {
        loop {
            match rx.recv().await {
                Some(ModemCommand::Start) => break,
                Some(ModemCommand::Destroy) => return self.do_destroy().await,
                Some(ModemCommand::Configure(cfg)) => self.apply_config(cfg),
                None => return,
            }
        }
        self.drive(&mut rx).await;
    }

    fn apply_config(&self, cfg: ModemConfig) {
        let mut m = self.modem.lock().unwrap();
        m.config = cfg;
        drop(m);
        self.configured.store(true, Ordering::SeqCst);
        self.config_notify.notify_waiters();
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    fn set_state(&mut self, state: ModemFsmState) {
        tracing::debug!(modem = %self.modem.lock().unwrap().name, state = ?state, "modem fsm transition");
        self.state = state;
    }

    /// Races an in-flight operation against the command channel so
    /// `DESTROY` (and a live `Configure`) are accepted from every state,
    /// per §4.4 "all states accept a global DESTROY event".
    async fn race<T>(&self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>, fut: impl std::future::Future<Output = T>) -> Step<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                v = &mut fut => return Step::Value(v),
                cmd = rx.recv() => match cmd {
                    Some(ModemCommand::Destroy) | None => return Step::Destroyed,
                    Some(ModemCommand::Configure(cfg)) => self.apply_config(cfg),
                    Some(ModemCommand::Start) => {}
                }
            }
        }
    }

    async fn drive(mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) {
        self.set_state(ModemFsmState::Resync);
        if !self.do_resync(rx).await {
            return;
        }
        self.set_state(ModemFsmState::GetVersion);
        if !self.do_get_version(rx).await {
            return;
        }

        // Spawn the SIM FSM concurrently as soon as the version handshake
        // completes (§4.4 "spawn SIM FSM START").
        let modem_for_sim = self.modem.clone();
        let device_for_sim = self.device.clone();
        let mut sim_fsm = SimFsm::new(self.clock.clone());
        let sim_task = tokio::spawn(async move { sim_fsm.run(&modem_for_sim, &device_for_sim).await });

        self.set_state(ModemFsmState::GetModel);
        if !self.do_get_model(rx).await {
            sim_task.abort();
            return;
        }

        self.set_state(ModemFsmState::Poweroff);
        if !self.do_poweroff(rx).await {
            sim_task.abort();
            return;
        }

        self.set_state(ModemFsmState::WaitUim);
        let sim_outcome = match self.race(rx, sim_task).await {
            Step::Value(Ok(outcome)) => outcome,
            Step::Value(Err(_)) => SimOutcome::Failed,
            Step::Destroyed => return self.do_destroy().await,
        };
        if !matches!(sim_outcome, SimOutcome::Ready) {
            self.modem.lock().unwrap().set_error(format!("SIM not ready: {sim_outcome:?}"));
            return self.fail_and_wait_destroy(rx).await;
        }

        self.set_state(ModemFsmState::ConfigureModem);
        if !self.do_configure_modem(rx).await {
            return;
        }

        self.set_state(ModemFsmState::ConfigureKernel);
        if !self.do_configure_kernel(rx).await {
            return;
        }

        self.set_state(ModemFsmState::Poweron);
        if !self.do_poweron(rx).await {
            return;
        }

        self.set_state(ModemFsmState::Netsearch);
        if !self.do_netsearch(rx).await {
            return;
        }

        self.set_state(ModemFsmState::Registered);
        match self.race(rx, self.clock.sleep(REGISTERED_SETTLE_DELAY)).await {
            Step::Value(()) => {}
            Step::Destroyed => return self.do_destroy().await,
        }

        self.set_state(ModemFsmState::StartIface);
        if !self.do_start_iface(rx).await {
            return;
        }

        self.set_state(ModemFsmState::Live);
        self.do_live(rx).await;

        // LIVE is terminal except for DESTROY; park here until it arrives.
        loop {
            match rx.recv().await {
                Some(ModemCommand::Destroy) | None => return self.do_destroy().await,
                Some(ModemCommand::Configure(cfg)) => self.apply_config(cfg),
                Some(ModemCommand::Start) => {}
            }
        }
    }

    async fn do_resync(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        match self.race(rx, self.device.request(ctl::SyncRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(_))) => true,
            Step::Value(_) => {
                self.modem.lock().unwrap().set_error("CTL sync failed or timed out");
                self.fail_and_wait_destroy(rx).await;
                false
            }
            Step::Destroyed => {
                self.do_destroy().await;
                false
            }
        }
    }

    async fn do_get_version(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        match self.race(rx, self.device.request(ctl::GetVersionInfoRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(resp))) => {
                let versions = resp.services.iter().map(|v| (v.service, v.major, v.minor)).collect();
                self.device.record_service_versions(versions);
                true
            }
            Step::Value(_) => {
                self.modem.lock().unwrap().set_error("CTL get-version-info failed");
                self.fail_and_wait_destroy(rx).await;
                false
            }
            Step::Destroyed => {
                self.do_destroy().await;
                false
            }
        }
    }

    async fn do_get_model(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        let model = match self.race(rx, self.device.request(dms::GetModelRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(r))) => Some(r.value),
            Step::Value(_) => None,
            Step::Destroyed => return self.abort_destroy().await,
        };
        let manufacturer = match self.race(rx, self.device.request(dms::GetManufacturerRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(r))) => Some(r.value),
            Step::Value(_) => None,
            Step::Destroyed => return self.abort_destroy().await,
        };
        let revision = match self.race(rx, self.device.request(dms::GetRevisionRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(r))) => Some(r.value),
            Step::Value(_) => None,
            Step::Destroyed => return self.abort_destroy().await,
        };
        let mut m = self.modem.lock().unwrap();
        m.identity.model = model;
        m.identity.manufacturer = manufacturer;
        m.identity.revision = revision;
        true
    }

    async fn abort_destroy(&mut self) -> bool {
        self.do_destroy().await;
        false
    }

    async fn do_poweroff(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        loop {
            let mode = match self.race(rx, self.device.request(dms::GetOperatingModeRequest)).await {
                Step::Value(Ok(RequestOutcome::Success(r))) => r.mode,
                Step::Value(_) => {
                    self.modem.lock().unwrap().set_error("DMS get-operating-mode failed");
                    self.fail_and_wait_destroy(rx).await;
                    return false;
                }
                Step::Destroyed => return self.abort_destroy().await,
            };

            match mode {
                OperatingMode::Online => {
                    match self.race(rx, self.device.request(dms::SetOperatingModeRequest { mode: OperatingMode::LowPower })).await {
                        Step::Value(_) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
                OperatingMode::LowPower => {
                    if self.is_configured() && self.modem.lock().unwrap().last_error.is_none() {
                        return true;
                    }
                    match self.race(rx, self.config_notify.notified()).await {
                        Step::Value(()) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
                _ => {
                    match self.race(rx, self.config_notify.notified()).await {
                        Step::Value(()) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
            }
        }
    }

    async fn do_configure_modem(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        let (apn, username, password, roaming, pdp_type) = {
            let m = self.modem.lock().unwrap();
            (m.config.apn.clone(), m.config.username.clone(), m.config.password.clone(), m.config.roaming, m.config.pdp_type)
        };
        let apn = match apn {
            Some(apn) => apn,
            None => {
                self.modem.lock().unwrap().set_error("no APN configured");
                self.fail_and_wait_destroy(rx).await;
                return false;
            }
        };

        let profiles = match self.race(rx, self.device.request(wds::GetProfileListRequest)).await {
            Step::Value(Ok(RequestOutcome::Success(r))) => r.profiles,
            Step::Value(_) => {
                self.modem.lock().unwrap().set_error("WDS get-profile-list failed");
                self.fail_and_wait_destroy(rx).await;
                return false;
            }
            Step::Destroyed => return self.abort_destroy().await,
        };
        let profile_index = profiles.first().map(|p| p.index).unwrap_or(1);

        let modify = wds::ModifyProfileRequest {
            index: profile_index,
            apn,
            username,
            password,
            pdp_type,
            roaming_disallowed: !roaming,
        };
        match self.race(rx, self.device.request(modify)).await {
            Step::Value(Ok(RequestOutcome::Success(_))) => true,
            Step::Value(_) => {
                self.modem.lock().unwrap().set_error("WDS modify-profile failed");
                self.fail_and_wait_destroy(rx).await;
                false
            }
            Step::Destroyed => self.abort_destroy().await,
        }
    }

    async fn do_configure_kernel(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        let (skip, device_path) = {
            let m = self.modem.lock().unwrap();
            (m.config.skip_configuration, m.device_path.clone())
        };

        if !skip {
            let (netdev, sysfs) = match self.netdev.refresh_device(&device_path).await {
                Ok(v) => v,
                Err(e) => {
                    self.modem.lock().unwrap().set_error(format!("netdev lookup failed: {e}"));
                    self.fail_and_wait_destroy(rx).await;
                    return false;
                }
            };
            let _ = self.netdev.iface_updown(&netdev, false).await;
            let _ = self
                .netdev
                .set_link_config(&sysfs, crate::netdev::LinkConfig { raw_ip: false, pass_through: false })
                .await;
            let _ = self.netdev.set_mtu(&netdev, DEFAULT_MTU).await;
            let _ = self.netdev.set_link_config(&sysfs, crate::netdev::LinkConfig { raw_ip: true, pass_through: false }).await;
            let _ = self.netdev.iface_updown(&netdev, true).await;
            self.modem.lock().unwrap().netif.kernel_device = Some(netdev);
        }

        let req = wda::SetDataFormatRequest { link_layer: wda::LinkLayerProtocol::RawIp, aggregation: wda::DataAggregation::Disabled };
        match self.race(rx, self.device.request(req)).await {
            Step::Value(Ok(RequestOutcome::Success(_))) => true,
            Step::Value(_) => {
                self.modem.lock().unwrap().set_error("WDA set-data-format failed");
                self.fail_and_wait_destroy(rx).await;
                false
            }
            Step::Destroyed => self.abort_destroy().await,
        }
    }

    async fn do_poweron(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        loop {
            let mode = match self.race(rx, self.device.request(dms::GetOperatingModeRequest)).await {
                Step::Value(Ok(RequestOutcome::Success(r))) => r.mode,
                Step::Value(_) => {
                    self.modem.lock().unwrap().set_error("DMS get-operating-mode failed");
                    self.fail_and_wait_destroy(rx).await;
                    return false;
                }
                Step::Destroyed => return self.abort_destroy().await,
            };
            match mode {
                OperatingMode::Online => return true,
                _ => match self.race(rx, self.device.request(dms::SetOperatingModeRequest { mode: OperatingMode::Online })).await {
                    Step::Value(_) => continue,
                    Step::Destroyed => return self.abort_destroy().await,
                },
            }
        }
    }

    async fn do_netsearch(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        let mask = IndicationMask { serving_system: true, subscription_info: true, system_info: true, signal_info: true, reject: true };
        match self.race(rx, self.device.request(nas::RegisterIndicationsRequest { mask })).await {
            Step::Value(_) => {}
            Step::Destroyed => return self.abort_destroy().await,
        }

        loop {
            let serving = match self.race(rx, self.device.request(nas::GetServingSystemRequest)).await {
                Step::Value(Ok(RequestOutcome::Success(r))) => r,
                Step::Value(_) => {
                    self.modem.lock().unwrap().set_error("NAS get-serving-system failed");
                    self.fail_and_wait_destroy(rx).await;
                    return false;
                }
                Step::Destroyed => return self.abort_destroy().await,
            };

            {
                let mut m = self.modem.lock().unwrap();
                m.registration.rat = Some(serving.rat);
                m.registration.mcc = serving.mcc;
                m.registration.mnc = serving.mnc;
                m.registration.mnc_len = serving.mnc_len;
                m.registration.operator_name = serving.operator_name.clone();
                m.registration.cs_attached = serving.cs_attached;
                m.registration.ps_attached = serving.ps_attached;
            }

            match serving.state {
                RegistrationState::Registered => return true,
                RegistrationState::NotRegistered | RegistrationState::RegistrationDenied => {
                    match self.race(rx, self.device.request(nas::ForceNetworkSearchRequest)).await {
                        Step::Value(_) => {}
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                    match self.race(rx, self.clock.sleep(NETSEARCH_POLL_INTERVAL)).await {
                        Step::Value(()) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
                RegistrationState::Searching | RegistrationState::Unknown => {
                    match self.race(rx, self.clock.sleep(NETSEARCH_POLL_INTERVAL)).await {
                        Step::Value(()) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
            }
        }
    }

    async fn do_start_iface(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) -> bool {
        let (profile_index, pdp_type) = {
            let m = self.modem.lock().unwrap();
            (1u8, m.config.pdp_type)
        };
        let ip_family = pdp_type.ip_family();
        let mut retries = 0u32;

        loop {
            let req = wds::StartNetworkRequest { profile_index, ip_family, autoconnect: false, apn: None };
            match self.race(rx, self.device.request(req)).await {
                Step::Value(Ok(RequestOutcome::Success(resp))) => {
                    self.modem.lock().unwrap().bearer.packet_data_handle = Some(resp.packet_data_handle);
                    return true;
                }
                Step::Value(Ok(RequestOutcome::Protocol(crate::error::QmiErrorCode::CallFailed))) => {
                    retries += 1;
                    if retries > START_IFACE_RETRY_CAP {
                        self.modem.lock().unwrap().set_error("start-network: retry budget exhausted (CALL_FAILED)");
                        self.fail_and_wait_destroy(rx).await;
                        return false;
                    }
                    match self.race(rx, self.clock.sleep(Duration::from_secs(2))).await {
                        Step::Value(()) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
                Step::Value(Ok(RequestOutcome::Protocol(crate::error::QmiErrorCode::NoEffect))) => {
                    let stop = wds::StopNetworkRequest { packet_data_handle: wds::STOP_NETWORK_ANY_HANDLE, disable_autoconnect: true };
                    match self.race(rx, self.device.request(stop)).await {
                        Step::Value(_) => continue,
                        Step::Destroyed => return self.abort_destroy().await,
                    }
                }
                Step::Value(_) => {
                    self.modem.lock().unwrap().set_error("start-network failed");
                    self.set_state(ModemFsmState::Poweroff);
                    if !self.do_poweroff(rx).await {
                        return false;
                    }
                    return false;
                }
                Step::Destroyed => return self.abort_destroy().await,
            }
        }
    }

    async fn do_live(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) {
        let pdp_type = self.modem.lock().unwrap().config.pdp_type;
        let ip_family = pdp_type.ip_family();
        match self.race(rx, self.device.request(wds::GetCurrentSettingsRequest { ip_family })).await {
            Step::Value(Ok(RequestOutcome::Success(settings))) => {
                let mut m = self.modem.lock().unwrap();
                m.bearer.v4_addr = settings.v4_addr;
                m.bearer.v4_mask = settings.v4_mask;
                m.bearer.v4_gateway = settings.v4_gateway;
                m.bearer.v6_addr = settings.v6_addr;
                m.bearer.dns1 = settings.v4_dns.first().map(|a| std::net::IpAddr::V4(*a)).or_else(|| settings.v6_dns.first().map(|a| std::net::IpAddr::V6(*a)));
                m.bearer.dns2 = settings.v4_dns.get(1).map(|a| std::net::IpAddr::V4(*a)).or_else(|| settings.v6_dns.get(1).map(|a| std::net::IpAddr::V6(*a)));
                m.bearer.pdp_type = Some(pdp_type);
            }
            _ => {
                tracing::warn!("WDS get-current-settings failed after LIVE; bearer fields left unset");
            }
        }
    }

    async fn fail_and_wait_destroy(&mut self, rx: &mut mpsc::UnboundedReceiver<ModemCommand>) {
        self.set_state(ModemFsmState::Failed);
        loop {
            match rx.recv().await {
                Some(ModemCommand::Destroy) | None => return self.do_destroy().await,
                Some(ModemCommand::Configure(cfg)) => self.apply_config(cfg),
                Some(ModemCommand::Start) => {}
            }
        }
    }

    async fn do_destroy(&mut self) {
        self.set_state(ModemFsmState::Destroy);
        self.device.close(Duration::from_secs(5)).await;
    }
}
