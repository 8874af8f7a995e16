//! `RpcFront` (§6): one method per RPC surface entry, returning plain
//! key/value tables the way the original reports results over its
//! ubus/VTY bindings. `LocalRpcFront` is the in-process stand-in this
//! crate ships instead of a real bus binding, which is out of scope.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::lifecycle::{DriverKind, Lifecycle, LifecycleError};
use crate::modem::ModemConfig;
use crate::codec::wds::PdpType;

pub type Table = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct ConfigureArgs {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pin: Option<String>,
    pub puk: Option<String>,
    pub roaming: bool,
    pub pdp_type: Option<PdpType>,
}

impl From<ConfigureArgs> for ModemConfig {
    fn from(a: ConfigureArgs) -> Self {
        ModemConfig {
            apn: a.apn,
            username: a.username,
            password: a.password,
            pin: a.pin,
            puk: a.puk,
            roaming: a.roaming,
            pdp_type: a.pdp_type.unwrap_or(PdpType::Ipv4),
            skip_configuration: false,
        }
    }
}

/// The external bus binding this daemon would be wired to in production
/// (ubus, D-Bus, ServiceFs). Every method mirrors one Lifecycle call and
/// reports failure the same key/value-table way a success would.
#[async_trait]
pub trait RpcFront: Send + Sync {
    async fn add_modem(&self, name: &str, device: &str, driver: DriverKind) -> Table;
    async fn remove_modem(&self, name: &str) -> Table;
    async fn configure(&self, name: &str, args: ConfigureArgs) -> Table;
    async fn opmode(&self, name: &str) -> Table;
    async fn networkstatus(&self, name: &str) -> Table;
    async fn dump(&self, name: &str) -> Table;
}

/// In-process implementation calling straight into the Lifecycle façade.
pub struct LocalRpcFront {
    lifecycle: Lifecycle,
}

impl LocalRpcFront {
    pub fn new(lifecycle: Lifecycle) -> Self {
        LocalRpcFront { lifecycle }
    }

    fn err_table(err: LifecycleError) -> Table {
        let mut t = Table::new();
        t.insert("error".to_string(), err.to_string());
        t
    }

    fn ok_table() -> Table {
        let mut t = Table::new();
        t.insert("result".to_string(), "ok".to_string());
        t
    }
}

#[async_trait]
impl RpcFront for LocalRpcFront {
    async fn add_modem(&self, name: &str, device: &str, driver: DriverKind) -> Table {
        match self.lifecycle.add_modem(name, device, driver).await {
            Ok(()) => Self::ok_table(),
            Err(e) => Self::err_table(e),
        }
    }

    async fn remove_modem(&self, name: &str) -> Table {
        match self.lifecycle.remove_modem(name).await {
            Ok(()) => Self::ok_table(),
            Err(e) => Self::err_table(e),
        }
    }

    async fn configure(&self, name: &str, args: ConfigureArgs) -> Table {
        match self.lifecycle.configure_modem(name, args.into()).await {
            Ok(()) => Self::ok_table(),
            Err(e) => Self::err_table(e),
        }
    }

    async fn opmode(&self, name: &str) -> Table {
        match self.lifecycle.get_operating_mode(name).await {
            Ok(mode) => {
                let mut t = Table::new();
                t.insert("mode".to_string(), format!("{mode:?}"));
                t
            }
            Err(e) => Self::err_table(e),
        }
    }

    async fn networkstatus(&self, name: &str) -> Table {
        match self.lifecycle.get_network_status(name).await {
            Ok(reg) => {
                let mut t = Table::new();
                t.insert("rat".to_string(), format!("{:?}", reg.rat));
                t.insert("mcc".to_string(), reg.mcc.map(|v| v.to_string()).unwrap_or_default());
                t.insert("mnc".to_string(), reg.mnc.map(|v| v.to_string()).unwrap_or_default());
                t.insert("operator".to_string(), reg.operator_name.clone().unwrap_or_default());
                t.insert("cs_attached".to_string(), reg.cs_attached.to_string());
                t.insert("ps_attached".to_string(), reg.ps_attached.to_string());
                t
            }
            Err(e) => Self::err_table(e),
        }
    }

    async fn dump(&self, name: &str) -> Table {
        match self.lifecycle.dump(name).await {
            Ok(snapshot) => match serde_json::to_value(&snapshot) {
                Ok(serde_json::Value::Object(map)) => {
                    map.into_iter().map(|(k, v)| (k, value_to_string(v))).collect()
                }
                _ => Table::new(),
            },
            Err(e) => Self::err_table(e),
        }
    }
}

fn value_to_string(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
