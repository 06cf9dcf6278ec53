//! Shared state of the Linux DVB input.
//!
//! All entities live in one registry behind a single lock. Operations take
//! the lock for their whole duration, so a monitor tick never observes a
//! half-finished start or stop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use dvb_protocol::FrontendType;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::DeviceBackend;
use crate::error::Result;
use crate::frontend::Frontend;
use crate::ingest::TsSink;
use crate::mux::{self, Mux, MuxInstance, Network, Service};
use crate::notify::{self, InputStatus};
use crate::settings::{self, SettingsStore, FRONTENDS_ROOT, NETWORKS_ROOT};
use crate::timer::MonitorTimer;

pub(crate) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) networks: BTreeMap<String, Network>,
    pub(crate) muxes: HashMap<String, Mux>,
    pub(crate) services: HashMap<String, Service>,
    pub(crate) frontends: BTreeMap<String, Frontend>,
    pub(crate) instances: HashMap<String, MuxInstance>,
}

/// Counts of entities restored by [`Context::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub networks: usize,
    pub muxes: usize,
    pub services: usize,
    pub frontends: usize,
}

pub struct Context {
    me: Weak<Context>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) backend: Arc<dyn DeviceBackend>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) sink: Arc<dyn TsSink>,
    pub(crate) timer: Arc<dyn MonitorTimer>,
    pub(crate) status_tx: broadcast::Sender<InputStatus>,
}

impl Context {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        settings: Arc<dyn SettingsStore>,
        sink: Arc<dyn TsSink>,
        timer: Arc<dyn MonitorTimer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry: Mutex::new(Registry::default()),
            backend,
            settings,
            sink,
            timer,
            status_tx: notify::channel(),
        })
    }

    pub(crate) fn weak(&self) -> Weak<Context> {
        self.me.clone()
    }

    /// Statistics emitted by the lock monitor.
    pub fn subscribe_status(&self) -> broadcast::Receiver<InputStatus> {
        self.status_tx.subscribe()
    }

    /// Restore networks, multiplexes, services and frontends from settings.
    ///
    /// Broken entries are skipped with a warning.
    pub fn load(&self) -> Result<LoadSummary> {
        let mut guard = self.registry.lock();
        let reg = &mut *guard;
        let store = self.settings.as_ref();
        let mut summary = LoadSummary::default();

        for net_id in store.list(NETWORKS_ROOT)? {
            let Some(conf) = store.load(&mux::network_config_key(&net_id))? else {
                continue;
            };
            let kind = conf
                .get("type")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<FrontendType>().ok());
            let Some(kind) = kind else {
                warn!("Network {} has no valid type, skipping", net_id);
                continue;
            };
            if let Err(e) = reg.insert_network(net_id.clone(), kind, &conf) {
                warn!("Skipping network {}: {}", net_id, e);
                continue;
            }
            summary.networks += 1;

            let prefix = format!("{}/muxes", settings::network_key(&net_id));
            for mux_id in store.list(&prefix)? {
                let Some(conf) = store.load(&mux::mux_config_key(&net_id, &mux_id))? else {
                    continue;
                };
                match reg.insert_mux(store, &net_id, mux_id.clone(), &conf, true) {
                    Ok(id) => {
                        summary.muxes += 1;
                        summary.services += reg.muxes.get(&id).map_or(0, |m| m.services.len());
                    }
                    Err(e) => warn!("Skipping mux {}: {}", mux_id, e),
                }
            }
        }

        for fe_id in store.list(FRONTENDS_ROOT)? {
            let Some(conf) = store.load(&settings::frontend_key(&fe_id))? else {
                continue;
            };
            match reg.insert_frontend(fe_id.clone(), &conf) {
                Ok(_) => summary.frontends += 1,
                Err(e) => warn!("Skipping frontend {}: {}", fe_id, e),
            }
        }

        info!(
            "Loaded {} networks, {} muxes, {} services, {} frontends",
            summary.networks, summary.muxes, summary.services, summary.frontends
        );
        Ok(summary)
    }
}
