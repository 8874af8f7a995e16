//! Seed scenario 4: a CTL sync indication arriving while two different
//! services have requests in flight cancels each of them exactly once,
//! regardless of which service they belong to.

mod common;

use std::time::Duration;

use qmid::codec::dms::GetModelRequest;
use qmid::codec::wds::GetProfileListRequest;
use qmid::codec::{ctl, QmiMessage, ServiceId};
use qmid::registry::RequestOutcome;
use qmid::transport::frame;
use qmid::transport::TransportMode;

#[tokio::test]
async fn sync_indication_cancels_pending_requests_on_every_service_once() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Raw, clock);

    // The stub only needs to handle Get-Client-Id allocation (generic in
    // `spawn_stub`); it never answers the business requests themselves, so
    // both stay pending until the sync indication cancels them.
    common::spawn_stub(loopback.clone(), TransportMode::Raw, 0, |_msg, _count| vec![]);

    let dms_task = tokio::spawn({
        let device = device.clone();
        async move { device.request(GetModelRequest).await }
    });
    let wds_task = tokio::spawn({
        let device = device.clone();
        async move { device.request(GetProfileListRequest).await }
    });

    // Let both services' Get-Client-Id round trips complete and their
    // requests reach the wire: 2 writes per service (alloc + request).
    let _ = tokio::time::timeout(Duration::from_secs(5), loopback.wait_for_write(3))
        .await
        .expect("both services should have allocated a client id and sent their request");

    let sync_indication = QmiMessage {
        service_id: ServiceId::Ctl,
        client_id: 0,
        flags: qmid::codec::ctl_flags::INDICATION,
        tid: 0,
        message_id: ctl::MSG_SYNC,
        payload: bytes::Bytes::new(),
    };
    loopback.push_inbound(&frame::encode_qmux(&sync_indication)).await;

    let dms_outcome = tokio::time::timeout(Duration::from_secs(5), dms_task).await.expect("dms request hung").unwrap();
    let wds_outcome = tokio::time::timeout(Duration::from_secs(5), wds_task).await.expect("wds request hung").unwrap();

    assert!(matches!(dms_outcome, Ok(RequestOutcome::Cancelled)), "DMS request must be cancelled exactly once");
    assert!(matches!(wds_outcome, Ok(RequestOutcome::Cancelled)), "WDS request must be cancelled exactly once");
}
