//! Seed scenario 5: a device opened in MBIM mode tunnels QMI requests
//! inside Command envelopes and unwraps responses from Command-Done
//! envelopes transparently to the caller.

mod common;

use std::time::Duration;

use qmid::codec::ctl::{self, GetVersionInfoResponse};
use qmid::codec::ServiceId;
use qmid::registry::RequestOutcome;
use qmid::transport::TransportMode;

#[tokio::test]
async fn mbim_tunnelled_request_round_trips_through_command_done() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Mbim, clock);

    // Write #0 is the proxy-control handshake; answer it first, then let
    // the stub take over from write #1 onward for the business traffic.
    common::complete_mbim_handshake(&loopback).await;
    common::spawn_stub(loopback, TransportMode::Mbim, 1, |msg, _count| {
        assert_eq!(msg.service_id, ServiceId::Ctl);
        assert_eq!(msg.message_id, ctl::MSG_GET_VERSION_INFO);
        vec![common::success(msg, &[])]
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), device.request(ctl::GetVersionInfoRequest))
        .await
        .expect("mbim-tunnelled request did not complete")
        .expect("request transport error");

    match outcome {
        RequestOutcome::Success(GetVersionInfoResponse { services }) => assert!(services.is_empty()),
        RequestOutcome::Protocol(code) => panic!("expected success, got protocol error {code:?}"),
        RequestOutcome::Cancelled => panic!("expected success, request was cancelled instead"),
    }
}
