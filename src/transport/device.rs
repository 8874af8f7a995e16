//! The Transaction Engine: a single background task owns one open device
//! (its file handle, its `ServiceRegistry`, and the QMUX/MBIM reassembler
//! state) and is the only code that ever touches them directly. Everything
//! else talks to it through a cloneable `DeviceHandle`, the way the
//! original's single-threaded event loop is the sole owner of a device's
//! file descriptor and every FSM reaches it through a dispatch queue.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::codec::{ctl, Decodable, Encodable, QmiMessage, ServiceId};
use crate::error::{QmiErrorCode, QmiResultCode, QmiResultTlv, QmidError, TransportError};
use crate::registry::{Completion, IndicationSubscription, RequestOutcome, ServiceRegistry, ServiceState};

use super::frame::{self, MbimPacket, MbimReassembler, QmuxReassembler};
use super::io::{self, Transport};

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open device: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a device speaks raw QMUX directly or tunnels it inside an MBIM
/// Command/Command-Done envelope over a `qmi-proxy`-style control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Raw,
    Mbim,
}

enum DeviceCommand {
    Request {
        service: ServiceId,
        message_id: u16,
        payload: bytes::Bytes,
        respond_to: oneshot::Sender<Completion>,
    },
    Subscribe {
        service: ServiceId,
        message_id: u16,
        callback: Box<dyn FnMut(&QmiMessage) + Send>,
    },
    Close {
        grace: Duration,
        respond_to: oneshot::Sender<()>,
    },
    CancelAll,
    RecordServiceVersions {
        versions: Vec<(ServiceId, u16, u16)>,
    },
}

/// A cheap, cloneable front for the device actor. Every FSM and the
/// lifecycle façade hold one of these rather than the `Device` itself.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::UnboundedSender<DeviceCommand>,
}

impl DeviceHandle {
    /// Sends a typed request, allocating a client id for its service first
    /// if this is the first request the device has ever made to it.
    pub async fn request<Req: Encodable>(&self, req: Req) -> Result<RequestOutcome<Req::Response>, QmidError> {
        let mut buf = BytesMut::new();
        req.encode_tlvs(&mut buf);
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::Request {
                service: Req::SERVICE,
                message_id: Req::MESSAGE_ID,
                payload: buf.freeze(),
                respond_to: tx,
            })
            .map_err(|_| QmidError::Transport(TransportError::Eof))?;
        let completion = rx.await.map_err(|_| QmidError::Transport(TransportError::Eof))?;
        match completion {
            Completion::Cancelled => Ok(RequestOutcome::Cancelled),
            Completion::Response { message, result } => match result {
                QmiResultCode::Success => Ok(RequestOutcome::Success(Req::Response::decode(message.tlvs())?)),
                QmiResultCode::Protocol(code) => Ok(RequestOutcome::Protocol(code)),
                QmiResultCode::Cancelled => Ok(RequestOutcome::Cancelled),
            },
        }
    }

    /// Registers a callback invoked, in order, for every indication the
    /// device receives matching `(service, message_id)`.
    pub fn subscribe<F>(&self, service: ServiceId, message_id: u16, callback: F)
    where
        F: FnMut(&QmiMessage) + Send + 'static,
    {
        let _ = self.tx.send(DeviceCommand::Subscribe { service, message_id, callback: Box::new(callback) });
    }

    /// Releases every allocated client id (except services marked
    /// `keep_on_close`) and waits for the device to settle, force-closing
    /// once `grace` elapses without every release completing.
    pub async fn close(&self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(DeviceCommand::Close { grace, respond_to: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Cancels every outstanding request on every service, as a CTL sync
    /// indication would, without waiting for one to actually arrive.
    pub fn cancel_all(&self) {
        let _ = self.tx.send(DeviceCommand::CancelAll);
    }

    /// Records each service's (major, minor) version as reported by a
    /// CTL Get-Version-Info round trip.
    pub fn record_service_versions(&self, versions: Vec<(ServiceId, u16, u16)>) {
        let _ = self.tx.send(DeviceCommand::RecordServiceVersions { versions });
    }
}

/// The actor itself. Lives entirely inside the task `spawn` hands to
/// tokio; nothing outside this module ever sees a `&mut Device`.
pub struct Device {
    registry: ServiceRegistry,
    mode: TransportMode,
    device_path: Option<String>,
    transport: Box<dyn Transport>,
    qmux: QmuxReassembler,
    mbim: MbimReassembler,
    clock: Arc<dyn Clock>,
    ctl_pending_allocs: HashMap<u16, ServiceId>,
    ctl_pending_releases: HashMap<u16, ServiceId>,
    closing: Option<oneshot::Sender<()>>,
    close_timer: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    terminated: bool,
}

impl Device {
    fn new(transport: Box<dyn Transport>, mode: TransportMode, device_path: Option<String>, clock: Arc<dyn Clock>) -> Self {
        Device {
            registry: ServiceRegistry::new(),
            mode,
            device_path,
            transport,
            qmux: QmuxReassembler::new(),
            mbim: MbimReassembler::new(),
            clock,
            ctl_pending_allocs: HashMap::new(),
            ctl_pending_releases: HashMap::new(),
            closing: None,
            close_timer: None,
            terminated: false,
        }
    }

    /// Opens a real character device and spawns its actor task.
    pub async fn open(path: impl AsRef<Path>, mode: TransportMode, clock: Arc<dyn Clock>) -> Result<DeviceHandle, OpenError> {
        let path = path.as_ref();
        let transport = io::CharDeviceTransport::open(path)?;
        Ok(Self::spawn(Box::new(transport), mode, Some(path.to_string_lossy().into_owned()), clock))
    }

    /// Spawns the actor task over an already-opened transport (production
    /// `CharDeviceTransport` or, in tests, a `LoopbackTransport`).
    pub fn spawn(transport: Box<dyn Transport>, mode: TransportMode, device_path: Option<String>, clock: Arc<dyn Clock>) -> DeviceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Device::new(transport, mode, device_path, clock);
        tokio::spawn(device.run(rx));
        DeviceHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        if self.mode == TransportMode::Mbim {
            if let Some(path) = self.device_path.clone() {
                self.do_mbim_handshake(&path).await;
            }
        }

        let mut read_buf = vec![0u8; 4096];
        while !self.terminated {
            let mut close_timer = self.close_timer.take();
            let timer_fut = async {
                match close_timer.as_mut() {
                    Some(fut) => fut.await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    self.close_timer = close_timer;
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                res = self.transport.read(&mut read_buf) => {
                    self.close_timer = close_timer;
                    match res {
                        Ok(0) => self.fail_transport(TransportError::Eof).await,
                        Ok(n) => {
                            let bytes = read_buf[..n].to_vec();
                            self.on_bytes(&bytes).await;
                        }
                        Err(e) => self.fail_transport(TransportError::Write(e.to_string())).await,
                    }
                }
                _ = timer_fut => {
                    self.complete_close(true).await;
                }
            }
        }
    }

    async fn do_mbim_handshake(&mut self, path: &str) {
        let tid = self.mbim.next_mbim_tid();
        let handshake = frame::mbim_proxy_handshake(path, tid, 5);
        if let Err(e) = self.transport.write_all(&handshake).await {
            self.fail_transport(TransportError::Write(e.to_string())).await;
            return;
        }
        let mut buf = vec![0u8; 4096];
        loop {
            match self.transport.read(&mut buf).await {
                Ok(0) => {
                    self.fail_transport(TransportError::Eof).await;
                    return;
                }
                Ok(n) => match self.mbim.feed(&buf[..n]) {
                    Ok(packets) => {
                        if packets.iter().any(|p| matches!(p, MbimPacket::ProxyHandshakeDone)) {
                            tracing::debug!("MBIM proxy handshake complete");
                            return;
                        }
                    }
                    Err(e) => {
                        self.fail_transport(e).await;
                        return;
                    }
                },
                Err(e) => {
                    self.fail_transport(TransportError::Write(e.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Request { service, message_id, payload, respond_to } => {
                self.begin_send(service, message_id, payload, respond_to).await;
            }
            DeviceCommand::Subscribe { service, message_id, callback } => {
                let svc = self.registry.find_or_create(service);
                svc.indications.push(IndicationSubscription { message_id, callback });
            }
            DeviceCommand::Close { grace, respond_to } => {
                self.begin_close(grace, respond_to).await;
            }
            DeviceCommand::CancelAll => {
                self.registry.cancel_all_on_device();
            }
            DeviceCommand::RecordServiceVersions { versions } => {
                self.registry.set_service_versions(&versions);
            }
        }
    }

    async fn begin_send(
        &mut self,
        service_id: ServiceId,
        message_id: u16,
        payload: bytes::Bytes,
        respond_to: oneshot::Sender<Completion>,
    ) {
        let state = self.registry.find_or_create(service_id).state;
        match state {
            ServiceState::Ready => self.send_now(service_id, message_id, payload, respond_to).await,
            ServiceState::WaitCid => {
                let svc = self.registry.find_mut(service_id).unwrap();
                svc.queued.push((message_id, payload, respond_to));
            }
            ServiceState::Idle => {
                {
                    let svc = self.registry.find_mut(service_id).unwrap();
                    svc.state = ServiceState::WaitCid;
                    svc.queued.push((message_id, payload, respond_to));
                }
                self.start_cid_allocation(service_id).await;
            }
        }
    }

    async fn send_now(&mut self, service_id: ServiceId, message_id: u16, payload: bytes::Bytes, respond_to: oneshot::Sender<Completion>) {
        let (tid, client_id) = {
            let svc = self.registry.find_mut(service_id).unwrap();
            let tid = match svc.allocate_tid() {
                Some(t) => t,
                None => {
                    let _ = respond_to.send(Completion::Response {
                        message: QmiMessage::empty(service_id),
                        result: QmiResultCode::Protocol(QmiErrorCode::TidExhausted),
                    });
                    return;
                }
            };
            svc.insert_pending(tid, respond_to);
            (tid, svc.client_id.unwrap_or(0))
        };
        let msg = QmiMessage { service_id, client_id, flags: 0, tid, message_id, payload };
        self.write_message(&msg).await;
    }

    async fn write_message(&mut self, msg: &QmiMessage) {
        let bytes = match self.mode {
            TransportMode::Raw => frame::encode_qmux(msg),
            TransportMode::Mbim => {
                let qmi_bytes = frame::encode_qmux(msg);
                let tid = self.mbim.next_mbim_tid();
                frame::mbim_wrap_qmi(&qmi_bytes, tid)
            }
        };
        if let Err(e) = self.transport.write_all(&bytes).await {
            self.fail_transport(TransportError::Write(e.to_string())).await;
        }
    }

    async fn start_cid_allocation(&mut self, service_id: ServiceId) {
        let tid = {
            let ctl = self.registry.find_mut(ServiceId::Ctl).unwrap();
            match ctl.allocate_tid() {
                Some(t) => t,
                None => {
                    self.fail_cid_allocation(service_id).await;
                    return;
                }
            }
        };
        {
            let ctl = self.registry.find_mut(ServiceId::Ctl).unwrap();
            ctl.insert_internal_pending(tid);
        }
        self.ctl_pending_allocs.insert(tid, service_id);
        let mut buf = BytesMut::new();
        ctl::GetClientIdRequest { service: service_id }.encode_tlvs(&mut buf);
        let msg = QmiMessage {
            service_id: ServiceId::Ctl,
            client_id: 0,
            flags: 0,
            tid,
            message_id: ctl::MSG_GET_CLIENT_ID,
            payload: buf.freeze(),
        };
        self.write_message(&msg).await;
    }

    async fn finish_cid_allocation(&mut self, service_id: ServiceId, msg: &QmiMessage, result: QmiResultTlv) {
        if result.is_success() {
            if let Ok(resp) = ctl::GetClientIdResponse::decode(msg.tlvs()) {
                let queued = {
                    let svc = self.registry.find_mut(service_id).unwrap();
                    svc.client_id = Some(resp.client_id);
                    svc.state = ServiceState::Ready;
                    std::mem::take(&mut svc.queued)
                };
                for (message_id, payload, respond_to) in queued {
                    self.send_now(service_id, message_id, payload, respond_to).await;
                }
                return;
            }
        }
        self.fail_cid_allocation(service_id).await;
    }

    async fn fail_cid_allocation(&mut self, service_id: ServiceId) {
        let queued = {
            let svc = self.registry.find_mut(service_id).unwrap();
            svc.state = ServiceState::Idle;
            std::mem::take(&mut svc.queued)
        };
        for (_message_id, _payload, respond_to) in queued {
            let _ = respond_to.send(Completion::Response {
                message: QmiMessage::empty(service_id),
                result: QmiResultCode::Protocol(QmiErrorCode::AllocFailed),
            });
        }
    }

    async fn begin_close(&mut self, grace: Duration, respond_to: oneshot::Sender<()>) {
        self.closing = Some(respond_to);
        let ready = self.registry.non_ctl_ready_services();
        let mut any_release_sent = false;
        for service_id in ready {
            let keep = self.registry.find(service_id).map(|s| s.keep_on_close).unwrap_or(false);
            if keep {
                self.registry.remove(service_id);
                continue;
            }
            self.start_cid_release(service_id).await;
            any_release_sent = true;
        }
        if !any_release_sent {
            self.complete_close(false).await;
            return;
        }
        self.close_timer = Some(self.clock.sleep(grace));
    }

    async fn start_cid_release(&mut self, service_id: ServiceId) {
        let client_id = match self.registry.find(service_id).and_then(|s| s.client_id) {
            Some(c) => c,
            None => {
                self.registry.remove(service_id);
                return;
            }
        };
        let tid = {
            let ctl = self.registry.find_mut(ServiceId::Ctl).unwrap();
            match ctl.allocate_tid() {
                Some(t) => t,
                None => {
                    self.registry.remove(service_id);
                    return;
                }
            }
        };
        {
            let ctl = self.registry.find_mut(ServiceId::Ctl).unwrap();
            ctl.insert_internal_pending(tid);
        }
        self.ctl_pending_releases.insert(tid, service_id);
        let mut buf = BytesMut::new();
        ctl::ReleaseClientIdRequest { service: service_id, client_id }.encode_tlvs(&mut buf);
        let msg = QmiMessage {
            service_id: ServiceId::Ctl,
            client_id: 0,
            flags: 0,
            tid,
            message_id: ctl::MSG_RELEASE_CLIENT_ID,
            payload: buf.freeze(),
        };
        self.write_message(&msg).await;
    }

    async fn finish_cid_release(&mut self, service_id: ServiceId) {
        self.registry.remove(service_id);
        if self.closing.is_some() && self.registry.non_ctl_ready_services().is_empty() && self.ctl_pending_releases.is_empty() {
            self.complete_close(false).await;
        }
    }

    async fn complete_close(&mut self, forced: bool) {
        if forced {
            tracing::warn!("device close grace period elapsed; force-closing with releases still outstanding");
        }
        self.close_timer = None;
        self.terminated = true;
        self.registry.cancel_all_on_device();
        if let Some(respond_to) = self.closing.take() {
            let _ = respond_to.send(());
        }
    }

    async fn fail_transport(&mut self, err: TransportError) {
        tracing::warn!(error = %err, "device transport failed; tearing down");
        self.registry.cancel_all_on_device();
        self.terminated = true;
        if let Some(respond_to) = self.closing.take() {
            let _ = respond_to.send(());
        }
    }

    async fn on_bytes(&mut self, data: &[u8]) {
        let messages = match self.mode {
            TransportMode::Raw => self.qmux.feed(data),
            TransportMode::Mbim => match self.mbim.feed(data) {
                Ok(packets) => {
                    let mut out = Vec::new();
                    let mut err = None;
                    for packet in packets {
                        if let MbimPacket::QmiCommandDone { payload } = packet {
                            match self.qmux.feed(&payload) {
                                Ok(mut msgs) => out.append(&mut msgs),
                                Err(e) => {
                                    err = Some(e);
                                    break;
                                }
                            }
                        }
                    }
                    match err {
                        Some(e) => Err(e),
                        None => Ok(out),
                    }
                }
                Err(e) => Err(e),
            },
        };
        match messages {
            Ok(msgs) => {
                for msg in msgs {
                    self.dispatch_incoming(msg).await;
                }
            }
            Err(e) => self.fail_transport(e).await,
        }
    }

    async fn dispatch_incoming(&mut self, msg: QmiMessage) {
        if msg.is_indication() {
            self.handle_indication(&msg).await;
        }
        if msg.is_response() {
            self.handle_response(msg).await;
        } else if !msg.is_indication() {
            tracing::debug!(service = ?msg.service_id, "dropping frame with neither response nor indication flag set");
        }
    }

    async fn handle_indication(&mut self, msg: &QmiMessage) {
        if matches!(msg.service_id, ServiceId::Ctl) && msg.message_id == ctl::MSG_SYNC {
            tracing::debug!("CTL sync indication received; cancelling all outstanding requests");
            self.registry.cancel_all_on_device();
            return;
        }
        if let Some(svc) = self.registry.find_mut(msg.service_id) {
            for sub in svc.indications.iter_mut() {
                if sub.message_id == msg.message_id {
                    (sub.callback)(msg);
                }
            }
        }
    }

    async fn handle_response(&mut self, msg: QmiMessage) {
        let result_tlv = msg.result();
        let result = if result_tlv.is_success() { QmiResultCode::Success } else { QmiResultCode::Protocol(result_tlv.error) };

        if matches!(msg.service_id, ServiceId::Ctl) {
            if let Some(service_id) = self.ctl_pending_allocs.remove(&msg.tid) {
                if let Some(ctl) = self.registry.find_mut(ServiceId::Ctl) {
                    ctl.remove_by_tid(msg.tid);
                }
                self.finish_cid_allocation(service_id, &msg, result_tlv).await;
                return;
            }
            if let Some(service_id) = self.ctl_pending_releases.remove(&msg.tid) {
                if let Some(ctl) = self.registry.find_mut(ServiceId::Ctl) {
                    ctl.remove_by_tid(msg.tid);
                }
                self.finish_cid_release(service_id).await;
                return;
            }
        }

        if let Some(svc) = self.registry.find_mut(msg.service_id) {
            if let Some(mut req) = svc.remove_by_tid(msg.tid) {
                req.complete(Completion::Response { message: msg, result });
            } else {
                tracing::debug!(service = ?msg.service_id, tid = msg.tid, "dropping response with no matching pending request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::codec::dms::GetModelRequest;
    use crate::transport::io::loopback::LoopbackTransport;

    fn spawn_loopback() -> (DeviceHandle, LoopbackTransport) {
        let loopback = LoopbackTransport::new();
        let handle = Device::spawn(Box::new(loopback.clone()), TransportMode::Raw, None, Arc::new(FakeClock::new()));
        (handle, loopback)
    }

    fn ctl_client_id_response(service: ServiceId, client_id: u8, tid: u8) -> bytes::Bytes {
        let mut tlvs = BytesMut::new();
        crate::codec::put_tlv(&mut tlvs, crate::codec::TLV_RESULT, &[0x00, 0x00, 0x00, 0x00]);
        crate::codec::put_tlv(&mut tlvs, 0x01, &[service.wire(), client_id]);
        let msg = QmiMessage {
            service_id: ServiceId::Ctl,
            client_id: 0,
            flags: crate::codec::ctl_flags::RESPONSE,
            tid: tid as u16,
            message_id: ctl::MSG_GET_CLIENT_ID,
            payload: tlvs.freeze(),
        };
        frame::encode_qmux(&msg)
    }

    #[tokio::test]
    async fn first_request_allocates_client_id_then_sends() {
        let (handle, loopback) = spawn_loopback();

        let req_task = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request(GetModelRequest).await }
        });

        // Give the actor a chance to observe the request and emit the
        // Get-Client-Id it triggers.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let writes = loopback.recorded_writes().await;
        assert_eq!(writes.len(), 1, "expected a single Get-Client-Id write before the user request is sent");

        let mut reassembler = QmuxReassembler::new();
        let parsed = reassembler.feed(&writes[0]).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].message_id, ctl::MSG_GET_CLIENT_ID);
        let alloc_tid = parsed[0].tid as u8;

        loopback.push_inbound(&ctl_client_id_response(ServiceId::Dms, 5, alloc_tid)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let writes = loopback.recorded_writes().await;
        assert_eq!(writes.len(), 2, "Get-Model should be flushed once the client id is allocated");

        // The pending Get-Model request is still outstanding (no response
        // fed yet); dropping the task cleanly exercises no more than the
        // allocate-then-flush path this test is about.
        req_task.abort();
    }

    #[tokio::test]
    async fn ctl_sync_indication_cancels_everything() {
        let (handle, loopback) = spawn_loopback();
        let req_task = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request(GetModelRequest).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sync_indication = QmiMessage {
            service_id: ServiceId::Ctl,
            client_id: 0,
            flags: crate::codec::ctl_flags::INDICATION,
            tid: 0,
            message_id: ctl::MSG_SYNC,
            payload: bytes::Bytes::new(),
        };
        loopback.push_inbound(&frame::encode_qmux(&sync_indication)).await;

        let outcome = req_task.await.unwrap().unwrap();
        assert!(matches!(outcome, RequestOutcome::Cancelled));
    }

    #[tokio::test]
    async fn close_with_no_services_open_completes_immediately() {
        let (handle, _loopback) = spawn_loopback();
        handle.close(Duration::from_secs(5)).await;
    }
}
