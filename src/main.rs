//! `qmid` daemon entry point: parses its startup configuration, wires
//! the transport/FSM stack behind the Lifecycle façade, and serves the
//! in-process RPC front until interrupted.

use std::sync::Arc;

use qmid::clock::TokioClock;
use qmid::lifecycle::{DriverKind, Lifecycle};
use qmid::rpc::{ConfigureArgs, LocalRpcFront, RpcFront};

#[derive(argh::FromArgs)]
/// QMI/MBIM cellular modem lifecycle daemon.
struct Args {
    /// character device to open at startup, e.g. /dev/cdc-wdm0
    #[argh(option)]
    device: Option<String>,

    /// name to register the startup device under
    #[argh(option, default = "String::from(\"modem0\")")]
    name: String,

    /// tunnel QMI over an MBIM control channel instead of raw QMUX
    #[argh(switch)]
    mbim: bool,

    /// APN to configure the startup device with
    #[argh(option)]
    apn: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "qmid=info".into()))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args: Args = argh::from_env();

    let clock = Arc::new(TokioClock);
    let lifecycle = Lifecycle::new(clock);
    let rpc = LocalRpcFront::new(lifecycle.clone());

    if let Some(device) = &args.device {
        let driver = if args.mbim { DriverKind::Mbim } else { DriverKind::Qmi };
        let result = rpc.add_modem(&args.name, device, driver).await;
        tracing::info!(?result, modem = %args.name, "add_modem");

        if args.apn.is_some() {
            let configure = rpc
                .configure(&args.name, ConfigureArgs { apn: args.apn.clone(), ..Default::default() })
                .await;
            tracing::info!(?configure, modem = %args.name, "configure");
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to install ctrl-c handler");
    }
    tracing::info!("shutting down");

    for name in lifecycle.list().await {
        let _ = rpc.remove_modem(&name).await;
    }
}
