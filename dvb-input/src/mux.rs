//! Networks, multiplexes, services and mux instances.
//!
//! A network owns an ordered list of multiplexes and knows which
//! frontends feed it. A multiplex carries its tuning parameters, its
//! services and its table filters. A mux instance binds a multiplex to one
//! frontend for tuning; an instance whose tune was rejected by the device
//! stays marked and is never tuned again.

use std::collections::BTreeSet;

use dvb_protocol::{
    ConfigMap, DeliveryFamily, FrontendType, MuxClass, TableDef, TuningParameters, PID_WILDCARD,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{new_id, Context, Registry};
use crate::demux::{DemuxTarget, MuxTables};
use crate::device::{FilterHandle, FrontendPaths};
use crate::error::{InputError, Result};
use crate::settings::{self, SettingsStore};

#[derive(Debug)]
pub struct Network {
    pub id: String,
    pub kind: FrontendType,
    pub name: String,
    pub(crate) muxes: Vec<String>,
    pub(crate) inputs: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkConfig {
    #[serde(rename = "type")]
    kind: FrontendType,
    #[serde(rename = "networkname", default)]
    name: String,
}

impl Network {
    fn to_config(&self) -> ConfigMap {
        let conf = NetworkConfig {
            kind: self.kind,
            name: self.name.clone(),
        };
        into_map(serde_json::to_value(conf))
    }

    pub fn muxes(&self) -> &[String] {
        &self.muxes
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{} network", self.kind)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug)]
pub struct Mux {
    pub id: String,
    pub network: String,
    pub onid: u16,
    pub tsid: u16,
    pub enabled: bool,
    pub params: TuningParameters,
    pub(crate) services: Vec<String>,
    pub(crate) tables: MuxTables,
    pub(crate) active: Option<String>,
}

impl Mux {
    /// Frequency in kHz (MHz for satellite), plus the polarisation letter for satellite.
    pub fn display_name(&self) -> String {
        let freq = self.params.frequency / 1000;
        match self.params.polarisation() {
            Some(pol) => format!("{}{}", freq, pol),
            None => freq.to_string(),
        }
    }

    pub fn to_config(&self) -> ConfigMap {
        let mut conf = self.params.to_config();
        conf.insert("onid".into(), Value::from(self.onid));
        conf.insert("tsid".into(), Value::from(self.tsid));
        conf.insert("enabled".into(), Value::from(self.enabled));
        conf
    }

    fn from_config(id: String, network: &Network, conf: &ConfigMap) -> Result<Self> {
        let params = TuningParameters::from_config(network.kind, conf)?;
        let u16_field = |key: &str| {
            conf.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(0)
        };
        Ok(Self {
            id,
            network: network.id.clone(),
            onid: u16_field("onid"),
            tsid: u16_field("tsid"),
            enabled: conf.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            params,
            services: Vec::new(),
            tables: MuxTables::new(),
            active: None,
        })
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn tables(&self) -> &MuxTables {
        &self.tables
    }

    pub fn active_instance(&self) -> Option<&str> {
        self.active.as_deref()
    }
}

/// One elementary stream and its demux filter.
#[derive(Debug)]
pub struct ElementaryStream {
    pub pid: u16,
    pub(crate) filter: Option<FilterHandle>,
}

impl ElementaryStream {
    pub fn new(pid: u16) -> Self {
        Self { pid, filter: None }
    }

    pub fn is_open(&self) -> bool {
        self.filter.is_some()
    }
}

#[derive(Debug)]
pub struct Service {
    pub id: String,
    pub mux: String,
    pub sid: u16,
    pub name: String,
    pub(crate) streams: Vec<ElementaryStream>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceConfig {
    sid: u16,
    #[serde(rename = "svcname", default)]
    name: String,
    #[serde(default)]
    pids: Vec<u16>,
}

impl Service {
    fn to_config(&self) -> ConfigMap {
        let conf = ServiceConfig {
            sid: self.sid,
            name: self.name.clone(),
            pids: self.streams.iter().map(|s| s.pid).collect(),
        };
        into_map(serde_json::to_value(conf))
    }

    fn from_config(id: String, mux: &str, conf: &ConfigMap) -> Result<Self> {
        let conf: ServiceConfig = serde_json::from_value(Value::Object(conf.clone()))
            .map_err(dvb_protocol::ProtocolError::from)?;
        Ok(Self {
            id,
            mux: mux.to_string(),
            sid: conf.sid,
            name: conf.name,
            streams: conf.pids.into_iter().map(ElementaryStream::new).collect(),
        })
    }

    pub fn streams(&self) -> &[ElementaryStream] {
        &self.streams
    }

    pub(crate) fn close_streams(&mut self) -> usize {
        let mut closed = 0;
        for st in &mut self.streams {
            if st.filter.take().is_some() {
                closed += 1;
            }
        }
        closed
    }
}

/// A multiplex bound to a frontend for tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxInstance {
    pub id: String,
    pub mux: String,
    pub frontend: String,
    /// Set when the device rejected the parameters. Never cleared.
    pub tune_failed: bool,
}

/// Display name and id of a network, as offered to a frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkRef {
    pub uuid: String,
    pub name: String,
}

fn into_map(value: serde_json::Result<Value>) -> ConfigMap {
    match value {
        Ok(Value::Object(map)) => map,
        _ => ConfigMap::new(),
    }
}

pub(crate) fn mux_config_key(network: &str, mux: &str) -> String {
    format!("{}/config", settings::mux_key(network, mux))
}

pub(crate) fn network_config_key(network: &str) -> String {
    format!("{}/config", settings::network_key(network))
}

impl Registry {
    pub(crate) fn network(&self, id: &str) -> Result<&Network> {
        self.networks
            .get(id)
            .ok_or_else(|| InputError::not_found("network", id))
    }

    pub(crate) fn mux(&self, id: &str) -> Result<&Mux> {
        self.muxes.get(id).ok_or_else(|| InputError::not_found("mux", id))
    }

    pub(crate) fn service(&self, id: &str) -> Result<&Service> {
        self.services
            .get(id)
            .ok_or_else(|| InputError::not_found("service", id))
    }

    pub(crate) fn mux_name(&self, id: &str) -> String {
        self.muxes
            .get(id)
            .map(Mux::display_name)
            .unwrap_or_else(|| id.to_string())
    }

    /// Display name and device paths of the frontend a multiplex is tuned on.
    pub(crate) fn mux_tuner(&self, id: &str) -> Option<(String, FrontendPaths)> {
        let inst = self.muxes.get(id)?.active.as_ref()?;
        let fe = self.frontends.get(&self.instances.get(inst)?.frontend)?;
        Some((fe.display_name(), fe.paths.clone()?))
    }

    fn mux_config(&self, id: &str) -> Result<(String, ConfigMap)> {
        let mux = self.mux(id)?;
        Ok((mux_config_key(&mux.network, &mux.id), mux.to_config()))
    }

    fn service_config(&self, id: &str) -> Result<(String, ConfigMap)> {
        let svc = self.service(id)?;
        let mux = self.mux(&svc.mux)?;
        Ok((
            settings::service_key(&mux.network, &mux.id, &svc.id),
            svc.to_config(),
        ))
    }

    pub(crate) fn insert_network(
        &mut self,
        id: String,
        kind: FrontendType,
        conf: &ConfigMap,
    ) -> Result<String> {
        let mut conf = conf.clone();
        conf.insert("type".into(), Value::from(kind.as_str()));
        let parsed: NetworkConfig = serde_json::from_value(Value::Object(conf))
            .map_err(dvb_protocol::ProtocolError::from)?;
        // frontends loaded before the network already point at it
        let inputs = self
            .frontends
            .values()
            .filter(|fe| fe.network.as_deref() == Some(id.as_str()))
            .map(|fe| fe.id.clone())
            .collect();
        let network = Network {
            id: id.clone(),
            kind: parsed.kind,
            name: parsed.name,
            muxes: Vec::new(),
            inputs,
        };
        self.networks.insert(id.clone(), network);
        Ok(id)
    }

    pub(crate) fn insert_mux(
        &mut self,
        store: &dyn SettingsStore,
        network: &str,
        id: String,
        conf: &ConfigMap,
        load_services: bool,
    ) -> Result<String> {
        let net = self.network(network)?;
        let mux = Mux::from_config(id.clone(), net, conf)?;
        debug!("{} - created mux {} in {}", mux.display_name(), id, net.display_name());

        if let Some(net) = self.networks.get_mut(network) {
            net.muxes.push(id.clone());
        }
        self.muxes.insert(id.clone(), mux);

        if load_services {
            let prefix = format!("{}/services", settings::mux_key(network, &id));
            for svc_id in store.list(&prefix)? {
                let Some(conf) = store.load(&format!("{}/{}", prefix, svc_id))? else {
                    continue;
                };
                match Service::from_config(svc_id.clone(), &id, &conf) {
                    Ok(svc) => self.insert_service(svc),
                    Err(e) => warn!("Skipping service {}: {}", svc_id, e),
                }
            }
        }
        Ok(id)
    }

    fn insert_service(&mut self, svc: Service) {
        if let Some(mux) = self.muxes.get_mut(&svc.mux) {
            mux.services.push(svc.id.clone());
        }
        self.services.insert(svc.id.clone(), svc);
    }
}

impl Context {
    /// Create and persist a network. `conf` may carry `networkname`.
    pub fn network_create(&self, kind: FrontendType, conf: &ConfigMap) -> Result<String> {
        let mut reg = self.registry.lock();
        let id = reg.insert_network(new_id(), kind, conf)?;
        let net = reg.network(&id)?;
        self.settings.save(&network_config_key(&id), &net.to_config())?;
        info!("Created {} network {}", kind, net.display_name());
        Ok(id)
    }

    /// Delete a network, its multiplexes and their persisted configuration.
    pub fn network_delete(&self, network: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let muxes = reg.network(network)?.muxes.clone();
        self.settings.remove(&settings::network_key(network))?;
        for mux in muxes {
            self.mux_destroy(&mut reg, &mux);
        }
        for fe in reg.frontends.values_mut() {
            if fe.network.as_deref() == Some(network) {
                fe.network = None;
            }
        }
        reg.networks.remove(network);
        Ok(())
    }

    /// Networks a frontend of this type can feed.
    pub fn network_list(&self, frontend: &str) -> Result<Vec<NetworkRef>> {
        let reg = self.registry.lock();
        let kind = reg.frontend(frontend)?.kind;
        Ok(reg
            .networks
            .values()
            .filter(|n| n.kind == kind)
            .map(|n| NetworkRef {
                uuid: n.id.clone(),
                name: n.display_name(),
            })
            .collect())
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.registry.lock().networks.keys().cloned().collect()
    }

    pub fn network_muxes(&self, network: &str) -> Result<Vec<String>> {
        Ok(self.registry.lock().network(network)?.muxes.clone())
    }

    /// Property schema for multiplexes of a network.
    pub fn mux_class(&self, network: &str) -> Result<MuxClass> {
        let reg = self.registry.lock();
        Ok(reg.network(network)?.kind.property_schema())
    }

    /// Create a multiplex from a configuration map and persist it.
    pub fn mux_create(&self, network: &str, conf: &ConfigMap) -> Result<String> {
        let mut reg = self.registry.lock();
        let id = reg.insert_mux(self.settings.as_ref(), network, new_id(), conf, false)?;
        let (key, conf) = reg.mux_config(&id)?;
        self.settings.save(&key, &conf)?;
        Ok(id)
    }

    /// Apply a partial update. Returns the write-once keys that were refused.
    pub fn mux_update(&self, mux: &str, conf: &ConfigMap) -> Result<Vec<String>> {
        let mut reg = self.registry.lock();
        let m = reg
            .muxes
            .get_mut(mux)
            .ok_or_else(|| InputError::not_found("mux", mux))?;
        let rejected = m.params.update(conf)?;
        if let Some(enabled) = conf.get("enabled").and_then(Value::as_bool) {
            m.enabled = enabled;
        }
        for key in &rejected {
            warn!("{} - {} is write-once, ignoring update", m.display_name(), key);
        }
        let (key, conf) = reg.mux_config(mux)?;
        self.settings.save(&key, &conf)?;
        Ok(rejected)
    }

    /// Persist a multiplex and return what was stored.
    pub fn save_mux(&self, mux: &str) -> Result<ConfigMap> {
        let reg = self.registry.lock();
        let (key, conf) = reg.mux_config(mux)?;
        self.settings.save(&key, &conf)?;
        Ok(conf)
    }

    /// Remove persisted configuration, then the multiplex itself.
    pub fn mux_delete(&self, mux: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let network = reg.mux(mux)?.network.clone();
        self.settings.remove(&settings::mux_key(&network, mux))?;
        self.mux_destroy(&mut reg, mux);
        if let Some(net) = reg.networks.get_mut(&network) {
            net.muxes.retain(|m| m != mux);
        }
        Ok(())
    }

    fn mux_destroy(&self, reg: &mut Registry, mux: &str) {
        let active_fe = reg
            .muxes
            .get(mux)
            .and_then(|m| m.active.as_ref())
            .and_then(|i| reg.instances.get(i))
            .map(|i| i.frontend.clone());
        if let Some(fe) = active_fe {
            self.stop_locked(reg, &fe);
        }
        let Some(m) = reg.muxes.remove(mux) else {
            return;
        };
        info!("{} - deleted", m.display_name());
        for svc in &m.services {
            reg.services.remove(svc);
            for fe in reg.frontends.values_mut() {
                fe.services.retain(|s| s != svc);
            }
        }
        reg.instances.retain(|_, i| i.mux != mux);
    }

    pub fn mux_display_name(&self, mux: &str) -> Result<String> {
        Ok(self.registry.lock().mux(mux)?.display_name())
    }

    pub fn mux_params(&self, mux: &str) -> Result<TuningParameters> {
        Ok(self.registry.lock().mux(mux)?.params)
    }

    /// Bind a multiplex to one frontend. Reuses an existing binding.
    pub fn create_instance(&self, mux: &str, frontend: &str) -> Result<String> {
        let mut reg = self.registry.lock();
        Self::instance_for(&mut reg, mux, frontend)
    }

    fn instance_for(reg: &mut Registry, mux: &str, frontend: &str) -> Result<String> {
        reg.mux(mux)?;
        reg.frontend(frontend)?;
        if let Some(existing) = reg
            .instances
            .values()
            .find(|i| i.mux == mux && i.frontend == frontend)
        {
            return Ok(existing.id.clone());
        }
        let id = new_id();
        reg.instances.insert(
            id.clone(),
            MuxInstance {
                id: id.clone(),
                mux: mux.to_string(),
                frontend: frontend.to_string(),
                tune_failed: false,
            },
        );
        Ok(id)
    }

    /// One instance per frontend feeding the multiplex's network.
    pub fn create_instances(&self, mux: &str) -> Result<Vec<String>> {
        let mut reg = self.registry.lock();
        let network = reg.mux(mux)?.network.clone();
        let inputs: Vec<String> = reg.network(&network)?.inputs.iter().cloned().collect();
        inputs
            .iter()
            .map(|fe| Self::instance_for(&mut reg, mux, fe))
            .collect()
    }

    pub fn instance(&self, id: &str) -> Option<MuxInstance> {
        self.registry.lock().instances.get(id).cloned()
    }

    /// Create a service on a multiplex and persist it.
    pub fn service_create(&self, mux: &str, sid: u16, name: &str, pids: &[u16]) -> Result<String> {
        let mut reg = self.registry.lock();
        reg.mux(mux)?;
        let svc = Service {
            id: new_id(),
            mux: mux.to_string(),
            sid,
            name: name.to_string(),
            streams: pids
                .iter()
                .filter(|pid| **pid < PID_WILDCARD)
                .map(|pid| ElementaryStream::new(*pid))
                .collect(),
        };
        let id = svc.id.clone();
        reg.insert_service(svc);
        let (key, conf) = reg.service_config(&id)?;
        self.settings.save(&key, &conf)?;
        Ok(id)
    }

    pub fn save_service(&self, service: &str) -> Result<ConfigMap> {
        let reg = self.registry.lock();
        let (key, conf) = reg.service_config(service)?;
        self.settings.save(&key, &conf)?;
        Ok(conf)
    }

    pub fn service_delete(&self, service: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let (key, _) = reg.service_config(service)?;
        self.settings.remove(&key)?;
        if let Some(svc) = reg.services.remove(service) {
            if let Some(mux) = reg.muxes.get_mut(&svc.mux) {
                mux.services.retain(|s| s != service);
            }
            for fe in reg.frontends.values_mut() {
                fe.services.retain(|s| s != service);
            }
        }
        Ok(())
    }

    /// PIDs of a service's streams that currently have an open filter.
    pub fn service_open_pids(&self, service: &str) -> Result<Vec<u16>> {
        let reg = self.registry.lock();
        Ok(reg
            .service(service)?
            .streams
            .iter()
            .filter(|s| s.is_open())
            .map(|s| s.pid)
            .collect())
    }

    pub fn mux_services(&self, mux: &str) -> Result<Vec<String>> {
        Ok(self.registry.lock().mux(mux)?.services.clone())
    }

    /// Register a PSI table on a multiplex.
    ///
    /// The filter is opened right away when the multiplex is tuned,
    /// otherwise when it next locks.
    pub fn table_install(&self, mux: &str, table: &TableDef) -> Result<()> {
        let mut guard = self.registry.lock();
        let reg = &mut *guard;
        reg.mux(mux)?;
        let tuner = reg.mux_tuner(mux);
        let Some(m) = reg.muxes.get_mut(mux) else {
            return Err(InputError::not_found("mux", mux));
        };
        let mux_name = m.display_name();
        match &tuner {
            Some((frontend, paths)) => {
                let target = DemuxTarget {
                    backend: self.backend.as_ref(),
                    frontend,
                    demux: &paths.demux,
                };
                m.tables.install(&mux_name, table, Some(&target));
            }
            None => m.tables.install(&mux_name, table, None),
        }
        Ok(())
    }

    /// Drop every table on `pid` and close its filter.
    pub fn table_uninstall(&self, mux: &str, pid: u16) -> Result<()> {
        let mut reg = self.registry.lock();
        reg.mux(mux)?;
        if let Some(m) = reg.muxes.get_mut(mux) {
            let mux_name = m.display_name();
            m.tables.uninstall(&mux_name, pid);
        }
        Ok(())
    }

    /// Table PIDs currently marked installed on a multiplex.
    pub fn mux_table_pids(&self, mux: &str) -> Result<Vec<u16>> {
        Ok(self.registry.lock().mux(mux)?.tables.installed().iter().collect())
    }
}
