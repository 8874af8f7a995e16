//! Service Registry and per-service pending-request bookkeeping.
//! One registry lives per `Device`.

use std::collections::HashMap;

use bytes::Bytes;
use slab::Slab;
use tokio::sync::oneshot;

use crate::codec::{QmiMessage, ServiceId};
use crate::error::QmiResultCode;

/// Outcome delivered to whoever is awaiting a `Request`: a completed
/// request's callback must have been invoked at most once. A one-shot
/// channel plays the role of "invoke the callback exactly once".
#[derive(Debug)]
pub enum Completion {
    Response { message: QmiMessage, result: QmiResultCode },
    Cancelled,
}

impl Completion {
    pub fn result(&self) -> QmiResultCode {
        match self {
            Completion::Response { result, .. } => *result,
            Completion::Cancelled => QmiResultCode::Cancelled,
        }
    }
}

/// What a caller of `DeviceHandle::request` gets back: a decoded response,
/// a protocol-level error reported by the device, or cancellation (a CTL
/// sync indication, or the device closing out from under the request).
#[derive(Debug)]
pub enum RequestOutcome<T> {
    Success(T),
    Protocol(crate::error::QmiErrorCode),
    Cancelled,
}

/// A single outstanding request on one `Service`.
pub struct Request {
    pub tid: u16,
    sender: Option<oneshot::Sender<Completion>>,
}

impl Request {
    /// Completes this request's callback exactly once. A second call is a
    /// no-op, matching the invariant that `complete` only ever flips
    /// `pending -> complete` a single time.
    pub fn complete(&mut self, completion: Completion) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(completion);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sender.is_some()
    }
}

/// (service, message_id) subscription invoked for every matching
/// indication, in registration order.
pub struct IndicationSubscription {
    pub message_id: u16,
    pub callback: Box<dyn FnMut(&QmiMessage) + Send>,
}

/// `SERVICE_IDLE` / `SERVICE_WAIT_CID` / `SERVICE_READY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    WaitCid,
    Ready,
}

/// One QMI service's client id, transaction id space, and pending work.
pub struct Service {
    pub service_id: ServiceId,
    pub client_id: Option<u8>,
    next_tid: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub state: ServiceState,
    pub pending: Slab<Request>,
    pub indications: Vec<IndicationSubscription>,
    /// Requests queued before the service is READY, waiting to be sent
    /// once a client id is allocated.
    pub queued: Vec<(u16, Bytes, oneshot::Sender<Completion>)>,
    /// If true, `close()` does not release this service's client id —
    /// it was supplied externally.
    pub keep_on_close: bool,
}

impl Service {
    fn new(service_id: ServiceId) -> Self {
        let (client_id, state) = if matches!(service_id, ServiceId::Ctl) {
            (Some(0), ServiceState::Ready)
        } else {
            (None, ServiceState::Idle)
        };
        Service {
            service_id,
            client_id,
            next_tid: 1,
            version_major: 0,
            version_minor: 0,
            state,
            pending: Slab::new(),
            indications: Vec::new(),
            queued: Vec::new(),
            keep_on_close: false,
        }
    }

    /// Advances `next_tid`, wrapping modulo the service's tid width and
    /// skipping 0. Returns
    /// `None` if every id in the width is already pending
    /// (`TID_EXHAUSTED`).
    pub fn allocate_tid(&mut self) -> Option<u16> {
        let width: u32 = if matches!(self.service_id, ServiceId::Ctl) { 1 << 8 } else { 1 << 16 };
        let in_use: std::collections::HashSet<u16> = self.pending.iter().map(|(_, r)| r.tid).collect();
        if in_use.len() as u32 >= width - 1 {
            return None;
        }
        loop {
            let candidate = self.next_tid % width;
            self.next_tid = self.next_tid.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            let candidate = candidate as u16;
            if !in_use.contains(&candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn find_pending_mut(&mut self, tid: u16) -> Option<(usize, &mut Request)> {
        self.pending.iter_mut().find(|(_, r)| r.tid == tid)
    }

    /// Cancels every pending request on this service. Safe to call while a
    /// callback invoked from here mutates `pending` further, because
    /// entries are drained up front.
    pub fn cancel_all(&mut self) {
        let keys: Vec<usize> = self.pending.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(mut req) = self.try_remove(key) {
                req.complete(Completion::Cancelled);
            }
        }
    }

    fn try_remove(&mut self, key: usize) -> Option<Request> {
        if self.pending.contains(key) {
            Some(self.pending.remove(key))
        } else {
            None
        }
    }

    pub fn set_version(&mut self, major: u16, minor: u16) {
        self.version_major = major;
        self.version_minor = minor;
    }

    pub fn remove_by_tid(&mut self, tid: u16) -> Option<Request> {
        let key = self.pending.iter().find(|(_, r)| r.tid == tid).map(|(k, _)| k)?;
        Some(self.pending.remove(key))
    }

    pub fn insert_pending(&mut self, tid: u16, sender: oneshot::Sender<Completion>) {
        self.pending.insert(Request { tid, sender: Some(sender) });
    }

    /// Reserves a tid for a request the engine itself originates (client id
    /// allocate/release) with no external caller awaiting completion.
    pub fn insert_internal_pending(&mut self, tid: u16) {
        self.pending.insert(Request { tid, sender: None });
    }
}

/// Per-open-device set of `Service` objects keyed by QMI service id.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let mut services = HashMap::new();
        services.insert(ServiceId::Ctl, Service::new(ServiceId::Ctl));
        ServiceRegistry { services }
    }

    pub fn find(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn find_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
        self.services.get_mut(&id)
    }

    pub fn find_or_create(&mut self, id: ServiceId) -> &mut Service {
        self.services.entry(id).or_insert_with(|| Service::new(id))
    }

    pub fn remove(&mut self, id: ServiceId) -> Option<Service> {
        self.services.remove(&id)
    }

    pub fn non_ctl_ready_services(&self) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|(id, s)| !matches!(id, ServiceId::Ctl) && s.state == ServiceState::Ready)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Records each service's (major, minor) version as reported by
    /// CTL Get-Version-Info, creating a registry entry for services not
    /// yet opened so the version is not lost if they are used later.
    pub fn set_service_versions(&mut self, versions: &[(ServiceId, u16, u16)]) {
        for &(service_id, major, minor) in versions {
            self.find_or_create(service_id).set_version(major, minor);
        }
    }

    pub fn cancel_all_on_device(&mut self) {
        for svc in self.services.values_mut() {
            svc.cancel_all();
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ServiceId, &mut Service)> {
        self.services.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_tid_wraps_without_zero() {
        let mut svc = Service::new(ServiceId::Ctl);
        for expected in 1..=255u16 {
            assert_eq!(svc.allocate_tid(), Some(expected));
            // simulate the request completing immediately so it never
            // counts against "in use" for the next allocation
        }
        assert_eq!(svc.allocate_tid(), Some(1));
    }

    #[test]
    fn service_tid_wraps_without_zero() {
        let mut svc = Service::new(ServiceId::Dms);
        svc.next_tid = 65535;
        assert_eq!(svc.allocate_tid(), Some(65535));
        assert_eq!(svc.allocate_tid(), Some(1));
    }

    #[test]
    fn ctl_client_id_zero_and_ready() {
        let svc = Service::new(ServiceId::Ctl);
        assert_eq!(svc.client_id, Some(0));
        assert_eq!(svc.state, ServiceState::Ready);
    }

    #[test]
    fn non_ctl_starts_idle_unallocated() {
        let svc = Service::new(ServiceId::Dms);
        assert_eq!(svc.client_id, None);
        assert_eq!(svc.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn cancel_all_completes_every_pending_request() {
        let mut svc = Service::new(ServiceId::Dms);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        svc.insert_pending(1, tx1);
        svc.insert_pending(2, tx2);
        svc.cancel_all();
        assert!(matches!(rx1.await.unwrap(), Completion::Cancelled));
        assert!(matches!(rx2.await.unwrap(), Completion::Cancelled));
        assert_eq!(svc.pending.len(), 0);
    }
}
