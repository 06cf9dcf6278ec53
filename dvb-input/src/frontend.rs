//! Frontend control.
//!
//! `start` programs the frontend and arms the lock monitor. The monitor
//! polls the status every 50ms until the frontend reports a lock or the
//! grace period runs out, and then once per second. On the first lock it
//! starts the DVR reader, installs the default tables and opens the
//! filters of every attached service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dvb_protocol::{
    ConfigMap, DeliveryFamily, FrontendType, SignalState, PID_WILDCARD,
};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{new_id, Context, Registry};
use crate::demux::{self, DemuxTarget};
use crate::device::{FrontendDevice, FrontendPaths};
use crate::error::{InputError, Result, TuneError};
use crate::ingest::{self, DvrShared, IngestHandle, InstanceSnapshot, ReaderParams};
use crate::notify::{InputStatus, MuxStatus, INPUT_TYPE};
use crate::settings;

/// How long after a tune a missing lock stays quiet.
pub const TUNE_GRACE: Duration = Duration::from_secs(4);

/// Status poll interval while waiting for a lock.
pub const LOCK_POLL: Duration = Duration::from_millis(50);

/// Status poll interval once locked, and the minimum spacing of
/// statistics while unlocked after the grace period.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

pub struct Frontend {
    pub id: String,
    pub adapter: u32,
    pub number: u32,
    pub name: String,
    pub kind: FrontendType,
    pub enabled: bool,
    /// Capture every PID instead of per-service filters.
    pub full_mux: bool,
    pub(crate) paths: Option<FrontendPaths>,
    pub(crate) network: Option<String>,
    pub(crate) device: Option<Box<dyn FrontendDevice>>,
    pub(crate) monitor_deadline: Instant,
    pub(crate) active: Option<String>,
    pub(crate) reader: Option<IngestHandle>,
    pub(crate) locked: bool,
    pub(crate) signal: Option<SignalState>,
    pub(crate) services: Vec<String>,
    pub(crate) dvr: Arc<DvrShared>,
}

impl Frontend {
    fn new(id: String, conf: FrontendConfig) -> Self {
        Self {
            id,
            adapter: conf.adapter,
            number: conf.number,
            name: conf.name,
            kind: conf.kind,
            enabled: conf.enabled,
            full_mux: conf.full_mux,
            paths: None,
            network: None,
            device: None,
            monitor_deadline: Instant::now(),
            active: None,
            reader: None,
            locked: false,
            signal: None,
            services: Vec::new(),
            dvr: DvrShared::new(),
        }
    }

    /// Configured name, else the frontend device path.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match &self.paths {
            Some(p) => p.frontend.display().to_string(),
            None => format!("adapter{}/frontend{}", self.adapter, self.number),
        }
    }

    fn to_config(&self) -> FrontendConfig {
        FrontendConfig {
            kind: self.kind,
            adapter: self.adapter,
            number: self.number,
            name: self.name.clone(),
            enabled: self.enabled,
            full_mux: self.full_mux,
            networks: self.network.clone(),
        }
    }

    fn info(&self) -> FrontendInfo {
        FrontendInfo {
            uuid: self.id.clone(),
            name: self.display_name(),
            kind: self.kind,
            adapter: self.adapter,
            number: self.number,
            enabled: self.enabled,
            full_mux: self.full_mux,
            network: self.network.clone(),
            active: self.active.clone(),
            locked: self.locked,
            signal: self.signal,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrontendConfig {
    #[serde(rename = "type")]
    kind: FrontendType,
    #[serde(default)]
    adapter: u32,
    #[serde(default)]
    number: u32,
    #[serde(rename = "displayname", default)]
    name: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(rename = "fullmux", default)]
    full_mux: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    networks: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Point-in-time view of a frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrontendInfo {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FrontendType,
    pub adapter: u32,
    pub number: u32,
    pub enabled: bool,
    pub full_mux: bool,
    pub network: Option<String>,
    pub active: Option<String>,
    pub locked: bool,
    pub signal: Option<SignalState>,
}

impl Registry {
    pub(crate) fn frontend(&self, id: &str) -> Result<&Frontend> {
        self.frontends
            .get(id)
            .ok_or_else(|| InputError::not_found("frontend", id))
    }

    fn frontend_mut(&mut self, id: &str) -> Result<&mut Frontend> {
        self.frontends
            .get_mut(id)
            .ok_or_else(|| InputError::not_found("frontend", id))
    }

    /// Build a frontend from persisted configuration. Requires `type`.
    pub(crate) fn insert_frontend(&mut self, id: String, conf: &ConfigMap) -> Result<String> {
        if !conf.contains_key("type") {
            return Err(InputError::MissingField("type"));
        }
        let conf: FrontendConfig = serde_json::from_value(Value::Object(conf.clone()))
            .map_err(dvb_protocol::ProtocolError::from)?;
        let network = conf.networks.clone();
        self.frontends.insert(id.clone(), Frontend::new(id.clone(), conf));
        if let Some(net) = network {
            if let Err(e) = self.set_network(&id, Some(net.as_str())) {
                warn!("Frontend {}: {}", id, e);
            }
        }
        Ok(id)
    }

    /// Returns whether anything changed.
    pub(crate) fn set_network(&mut self, frontend: &str, network: Option<&str>) -> Result<bool> {
        let fe = self.frontend(frontend)?;
        if fe.kind == FrontendType::Dvbs {
            return Err(InputError::NetworkNotSettable(fe.kind));
        }
        if fe.network.as_deref() == network {
            return Ok(false);
        }
        if let Some(net) = network {
            let n = self.network(net)?;
            if n.kind != fe.kind {
                return Err(InputError::WrongNetworkType {
                    frontend: fe.display_name(),
                    frontend_type: fe.kind,
                    network: n.display_name(),
                    network_type: n.kind,
                });
            }
        }

        let old = self.frontend(frontend)?.network.clone();
        if let Some(old) = old.and_then(|o| self.networks.get_mut(&o)) {
            old.inputs.remove(frontend);
        }
        if let Some(new) = network.and_then(|n| self.networks.get_mut(n)) {
            new.inputs.insert(frontend.to_string());
        }
        let fe = self.frontend_mut(frontend)?;
        fe.network = network.map(str::to_string);
        debug!("{} - network set to {:?}", fe.display_name(), fe.network);
        Ok(true)
    }

    fn snapshot(&self, frontend: &Frontend) -> Option<InstanceSnapshot> {
        let inst = self.instances.get(frontend.active.as_ref()?)?;
        Some(InstanceSnapshot {
            instance: inst.id.clone(),
            mux: inst.mux.clone(),
            mux_name: self.mux_name(&inst.mux),
            frontend: frontend.display_name(),
        })
    }
}

impl Context {
    /// A frontend device was found. Creates the frontend, or refreshes the
    /// device paths of the configured one at the same position.
    pub fn frontend_added(
        &self,
        adapter: u32,
        number: u32,
        paths: FrontendPaths,
        kind: FrontendType,
    ) -> Result<String> {
        let mut reg = self.registry.lock();
        let existing = reg
            .frontends
            .values_mut()
            .find(|fe| fe.adapter == adapter && fe.number == number);

        if let Some(fe) = existing {
            if fe.kind != kind {
                error!(
                    "{} - type changed from {} to {}",
                    fe.display_name(),
                    fe.kind,
                    kind
                );
                return Err(InputError::TypeMismatch {
                    number,
                    existing: fe.kind,
                    discovered: kind,
                });
            }
            fe.paths = Some(paths);
            return Ok(fe.id.clone());
        }

        let conf = FrontendConfig {
            kind,
            adapter,
            number,
            name: String::new(),
            enabled: true,
            full_mux: false,
            networks: None,
        };
        let id = new_id();
        let mut fe = Frontend::new(id.clone(), conf);
        fe.paths = Some(paths);
        info!("{} - added {} frontend", fe.display_name(), kind);
        reg.frontends.insert(id.clone(), fe);
        Ok(id)
    }

    /// Create a frontend from a configuration map. `type` is required.
    pub fn frontend_create(&self, conf: &ConfigMap) -> Result<String> {
        self.registry.lock().insert_frontend(new_id(), conf)
    }

    /// Apply `displayname`, `enabled`, `fullmux` and `networks`, then persist.
    pub fn frontend_update(&self, frontend: &str, conf: &ConfigMap) -> Result<ConfigMap> {
        let mut reg = self.registry.lock();
        {
            let fe = reg.frontend_mut(frontend)?;
            if let Some(name) = conf.get("displayname").and_then(Value::as_str) {
                fe.name = name.to_string();
            }
            if let Some(enabled) = conf.get("enabled").and_then(Value::as_bool) {
                fe.enabled = enabled;
            }
            if let Some(full_mux) = conf.get("fullmux").and_then(Value::as_bool) {
                fe.full_mux = full_mux;
            }
        }
        match conf.get("networks") {
            Some(Value::String(net)) => {
                reg.set_network(frontend, Some(net.as_str()))?;
            }
            Some(Value::Null) => {
                reg.set_network(frontend, None)?;
            }
            _ => {}
        }
        self.save_frontend_locked(&reg, frontend)
    }

    /// Attach the frontend to a network. Returns whether anything changed.
    pub fn set_network(&self, frontend: &str, network: Option<&str>) -> Result<bool> {
        self.registry.lock().set_network(frontend, network)
    }

    pub fn save_frontend(&self, frontend: &str) -> Result<ConfigMap> {
        let reg = self.registry.lock();
        self.save_frontend_locked(&reg, frontend)
    }

    fn save_frontend_locked(&self, reg: &Registry, frontend: &str) -> Result<ConfigMap> {
        let fe = reg.frontend(frontend)?;
        let conf = match serde_json::to_value(fe.to_config()) {
            Ok(Value::Object(map)) => map,
            _ => ConfigMap::new(),
        };
        self.settings.save(&settings::frontend_key(frontend), &conf)?;
        Ok(conf)
    }

    /// Enabled, present and accessible read/write.
    pub fn is_enabled(&self, frontend: &str) -> bool {
        let reg = self.registry.lock();
        let Ok(fe) = reg.frontend(frontend) else {
            return false;
        };
        fe.enabled
            && fe
                .paths
                .as_ref()
                .map_or(false, |p| self.backend.is_accessible(&p.frontend))
    }

    pub fn frontend_ids(&self) -> Vec<String> {
        self.registry.lock().frontends.keys().cloned().collect()
    }

    pub fn frontend_info(&self, frontend: &str) -> Option<FrontendInfo> {
        self.registry.lock().frontends.get(frontend).map(Frontend::info)
    }

    /// Tune `frontend` to the multiplex of `instance`.
    pub fn start(&self, frontend: &str, instance: &str) -> std::result::Result<(), TuneError> {
        self.start_with_frequency(frontend, instance, None)
    }

    /// Like [`Context::start`], tuning to `frequency` instead of the
    /// multiplex frequency when set.
    pub fn start_with_frequency(
        &self,
        frontend: &str,
        instance: &str,
        frequency: Option<u32>,
    ) -> std::result::Result<(), TuneError> {
        self.start_at(frontend, instance, frequency, Instant::now())
    }

    pub(crate) fn start_at(
        &self,
        frontend: &str,
        instance: &str,
        frequency: Option<u32>,
        now: Instant,
    ) -> std::result::Result<(), TuneError> {
        let mut guard = self.registry.lock();
        let reg = &mut *guard;

        let fe = reg
            .frontends
            .get(frontend)
            .ok_or_else(|| TuneError::NotFound(format!("frontend {}", frontend)))?;
        let name = fe.display_name();
        if fe.active.as_deref() == Some(instance) {
            return Ok(());
        }
        let inst = match reg.instances.get(instance) {
            Some(inst) if inst.frontend == frontend => inst,
            _ => return Err(TuneError::NotFound(format!("mux instance {}", instance))),
        };
        let mux_id = inst.mux.clone();
        let mux_name = reg.mux_name(&mux_id);
        if inst.tune_failed {
            debug!("{} - {} previously failed to tune", name, mux_name);
            return Err(TuneError::TuningFailedPermanent {
                frontend: name,
                mux: mux_name,
            });
        }
        let (params, mux_active) = match reg.muxes.get(&mux_id) {
            Some(mux) => (mux.params, mux.active.clone()),
            None => return Err(TuneError::NotFound(format!("mux {}", mux_id))),
        };
        if let Some(other) = mux_active.filter(|a| a.as_str() != instance) {
            let owner = reg
                .instances
                .get(&other)
                .and_then(|i| reg.frontends.get(&i.frontend))
                .map_or(other, |f| f.display_name());
            warn!("{} - {} is already tuned on {}", name, mux_name, owner);
            return Err(TuneError::TuningFailed {
                frontend: name,
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("mux active on {}", owner),
                ),
            });
        }

        if fe.active.is_some() {
            self.stop_locked(reg, frontend);
        }

        let Some(fe) = reg.frontends.get_mut(frontend) else {
            return Err(TuneError::NotFound(format!("frontend {}", frontend)));
        };
        if fe.active.is_some() {
            error!("{} - previous mux still active", name);
            return Err(TuneError::TuningFailed {
                frontend: name,
                source: std::io::Error::new(std::io::ErrorKind::Other, "frontend busy"),
            });
        }
        let Some(paths) = fe.paths.clone() else {
            return Err(TuneError::DeviceUnavailable {
                frontend: name,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no device"),
            });
        };

        // the control device stays open across tunes
        let device = match fe.device.take() {
            Some(device) => device,
            None => {
                trace!("{} - opening FE {}", name, paths.frontend.display());
                match self.backend.open_frontend(&paths.frontend) {
                    Ok(device) => device,
                    Err(e) => {
                        error!("{} - failed to open {} [e={}]", name, paths.frontend.display(), e);
                        return Err(TuneError::DeviceUnavailable {
                            frontend: name,
                            source: e,
                        });
                    }
                }
            }
        };
        let device = fe.device.insert(device);

        let cmds = fe.kind.build_commands(&params, frequency);
        debug!("{} - tuning to {}", name, mux_name);

        if let Err(e) = device.clear() {
            error!("{} - DTV_CLEAR failed [e={}]", name, e);
            return Err(TuneError::TuningFailed {
                frontend: name,
                source: e,
            });
        }
        match device.discard_events() {
            Ok(0) => {}
            Ok(n) => trace!("{} - discarded {} stale events", name, n),
            Err(e) => debug!("{} - event drain failed: {}", name, e),
        }
        for cmd in &cmds {
            trace!("{} - S2CMD {}", name, cmd);
        }
        if let Err(e) = device.commit(&cmds) {
            error!("{} - failed to tune [e={}]", name, e);
            if e.raw_os_error() == Some(Errno::EINVAL as i32) {
                if let Some(inst) = reg.instances.get_mut(instance) {
                    inst.tune_failed = true;
                }
                return Err(TuneError::TuningFailedPermanent {
                    frontend: name,
                    mux: mux_name,
                });
            }
            return Err(TuneError::TuningFailed {
                frontend: name,
                source: e,
            });
        }

        fe.active = Some(instance.to_string());
        fe.locked = false;
        fe.signal = None;
        fe.monitor_deadline = now + TUNE_GRACE;
        if let Some(mux) = reg.muxes.get_mut(&mux_id) {
            mux.active = Some(instance.to_string());
        }
        info!("{} - tuned to {}", name, mux_name);
        self.timer.arm(self.weak(), frontend, LOCK_POLL);
        Ok(())
    }

    /// Stop the active multiplex, if any.
    pub fn stop(&self, frontend: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        reg.frontend(frontend)?;
        self.stop_locked(&mut reg, frontend);
        Ok(())
    }

    pub(crate) fn stop_locked(&self, reg: &mut Registry, frontend: &str) {
        self.timer.disarm(frontend);
        let Some(fe) = reg.frontends.get_mut(frontend) else {
            return;
        };
        let name = fe.display_name();
        let Some(instance) = fe.active.take() else {
            return;
        };

        if let Some(reader) = fe.reader.take() {
            debug!("{} - stopping dvr thread", name);
            if let Some(exit) = reader.stop() {
                trace!("{} - dvr thread exited: {:?}", name, exit);
            }
        }
        fe.locked = false;
        fe.signal = None;
        let services = std::mem::take(&mut fe.services);

        for svc in services {
            if let Some(svc) = reg.services.get_mut(&svc) {
                let closed = svc.close_streams();
                if closed > 0 {
                    trace!("{} - closed {} filters of {}", name, closed, svc.name);
                }
            }
        }

        if let Some(inst) = reg.instances.remove(&instance) {
            let owned = reg
                .muxes
                .get_mut(&inst.mux)
                .filter(|m| m.active.as_deref() == Some(instance.as_str()));
            if let Some(mux) = owned {
                let mux_name = mux.display_name();
                mux.tables.uninstall_all(&mux_name);
                mux.active = None;
                info!("{} - stopped {}", name, mux_name);
            }
        }
    }

    /// Stop every frontend.
    pub fn stop_all(&self) {
        let mut reg = self.registry.lock();
        let ids: Vec<String> = reg.frontends.keys().cloned().collect();
        for id in ids {
            self.stop_locked(&mut reg, &id);
        }
    }

    /// One lock monitor tick.
    pub fn monitor_tick(&self, frontend: &str, now: Instant) {
        let mut guard = self.registry.lock();
        let reg = &mut *guard;
        let Some(fe) = reg.frontends.get_mut(frontend) else {
            return;
        };
        let name = fe.display_name();
        if fe.active.is_none() {
            trace!("{} - no active mux", name);
            return;
        }

        let accessible = fe
            .paths
            .as_ref()
            .map_or(false, |p| self.backend.is_accessible(&p.frontend));
        if !accessible {
            error!("{} - device is not accessible, stopping monitor", name);
            return;
        }

        let status = match fe.device.as_mut().map(|d| d.read_status()) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!("{} - FE_READ_STATUS error {}", name, e);
                return;
            }
            None => {
                warn!("{} - frontend not open", name);
                return;
            }
        };
        let signal = status.classify();
        if fe.signal != Some(signal) {
            trace!("{} - status {:?} ({:#04x})", name, signal, status.bits());
        }
        fe.signal = Some(signal);

        if fe.locked {
            self.timer.arm(self.weak(), frontend, MONITOR_INTERVAL);
        } else if signal == SignalState::Good {
            self.timer.arm(self.weak(), frontend, MONITOR_INTERVAL);
            fe.locked = true;
            info!("{} - locked", name);
            self.on_lock(reg, frontend);
        } else {
            self.timer.arm(self.weak(), frontend, LOCK_POLL);
            if now < fe.monitor_deadline {
                return;
            }
            fe.monitor_deadline = now + MONITOR_INTERVAL;
        }

        self.emit_stats(reg, frontend);
    }

    fn on_lock(&self, reg: &mut Registry, frontend: &str) {
        let Some(fe) = reg.frontends.get(frontend) else {
            return;
        };
        let Some(snapshot) = reg.snapshot(fe) else {
            return;
        };
        let Some(paths) = fe.paths.clone() else {
            return;
        };
        let name = fe.display_name();
        let kind = fe.kind;
        let full_mux = fe.full_mux;
        let dvr = Arc::clone(&fe.dvr);
        let mux_id = snapshot.mux.clone();

        let params = ReaderParams {
            name: name.clone(),
            backend: Arc::clone(&self.backend),
            sink: Arc::clone(&self.sink),
            paths: paths.clone(),
        };
        let reader = match ingest::start(params, &dvr, Some(snapshot), full_mux) {
            Ok(reader) => Some(reader),
            Err(e) => {
                error!("{} - failed to start dvr thread: {}", name, e);
                None
            }
        };
        if let Some(fe) = reg.frontends.get_mut(frontend) {
            fe.reader = reader;
        }

        if let Some(mux) = reg.muxes.get_mut(&mux_id) {
            let target = DemuxTarget {
                backend: self.backend.as_ref(),
                frontend: &name,
                demux: &paths.demux,
            };
            let mux_name = mux.display_name();
            for table in kind.default_tables() {
                mux.tables.install(&mux_name, table, Some(&target));
            }
            mux.tables.open_installed(&mux_name, &target);
        }

        let services = reg
            .frontends
            .get(frontend)
            .map(|fe| fe.services.clone())
            .unwrap_or_default();
        for svc in services {
            self.open_service_filters(reg, frontend, &svc);
        }
    }

    /// Attach a service and, when locked, open its stream filters.
    pub fn open_service(&self, frontend: &str, service: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        reg.service(service)?;
        let fe = reg.frontend_mut(frontend)?;
        if !fe.services.iter().any(|s| s == service) {
            fe.services.push(service.to_string());
        }
        self.open_service_filters(&mut reg, frontend, service);
        Ok(())
    }

    /// Detach a service and close its stream filters.
    pub fn close_service(&self, frontend: &str, service: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let fe = reg.frontend_mut(frontend)?;
        fe.services.retain(|s| s != service);
        let name = fe.display_name();
        let svc = reg
            .services
            .get_mut(service)
            .ok_or_else(|| InputError::not_found("service", service))?;
        let closed = svc.close_streams();
        if closed > 0 {
            trace!("{} - closed {} filters of {}", name, closed, svc.name);
        }
        Ok(())
    }

    fn open_service_filters(&self, reg: &mut Registry, frontend: &str, service: &str) {
        let Some(fe) = reg.frontends.get(frontend) else {
            return;
        };
        if !fe.locked || fe.full_mux {
            return;
        }
        let Some(inst) = fe.active.as_ref().and_then(|i| reg.instances.get(i)) else {
            return;
        };
        if inst.tune_failed {
            return;
        }
        let Some(paths) = fe.paths.as_ref() else {
            return;
        };
        let name = fe.display_name();
        let Some(svc) = reg.services.get_mut(service) else {
            return;
        };
        if svc.mux != inst.mux {
            debug!("{} - {} is not on the tuned mux", name, svc.name);
            return;
        }
        for st in &mut svc.streams {
            if st.pid >= PID_WILDCARD || st.filter.is_some() {
                continue;
            }
            st.filter = demux::open_pid(self.backend.as_ref(), &name, &paths.demux, st.pid).ok();
        }
    }

    fn emit_stats(&self, reg: &Registry, frontend: &str) {
        let Some(fe) = reg.frontends.get(frontend) else {
            return;
        };
        let muxes = fe
            .active
            .as_ref()
            .and_then(|i| reg.instances.get(i))
            .and_then(|i| reg.muxes.get(&i.mux))
            .map(|m| {
                vec![MuxStatus {
                    name: m.display_name(),
                    bytes: 0,
                }]
            })
            .unwrap_or_default();
        let status = InputStatus {
            uuid: fe.id.clone(),
            name: fe.display_name(),
            kind: INPUT_TYPE,
            muxes,
            bytes: fe.dvr.take_bytes(),
        };
        // no subscribers is fine
        let _ = self.status_tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{conf, test_context, TestContext};
    use dvb_protocol::{tables, DtvCmd, DtvCommand, FeStatus, TableDef};
    use serde_json::json;
    use std::io::Write;

    const PMT: TableDef = TableDef {
        name: "pmt",
        pid: 0x0020,
        table_id: 0x02,
        ..tables::PAT
    };

    struct Tuned {
        fe: String,
        mux: String,
        inst: String,
        svc: String,
    }

    fn tuned_setup(t: &TestContext) -> Tuned {
        let net = t
            .ctx
            .network_create(FrontendType::Dvbt, &conf(json!({"networkname": "Terrestrial"})))
            .unwrap();
        let mux = t
            .ctx
            .mux_create(
                &net,
                &conf(json!({"frequency": 498000000, "bandwidth": "8MHz"})),
            )
            .unwrap();
        let svc = t.ctx.service_create(&mux, 1, "One", &[0x100, 0x101]).unwrap();
        let fe = t
            .ctx
            .frontend_added(0, 0, FrontendPaths::for_adapter(0, 0), FrontendType::Dvbt)
            .unwrap();
        assert!(t.ctx.set_network(&fe, Some(net.as_str())).unwrap());
        let inst = t.ctx.create_instances(&mux).unwrap().remove(0);
        Tuned { fe, mux, inst, svc }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_start_commits_once_and_arms_fast_poll() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();

        let st = t.dev.state.lock();
        assert_eq!(st.frontend_opens, 1);
        assert_eq!(st.clears, 1);
        assert_eq!(st.commits.len(), 1);
        let cmds = &st.commits[0];
        assert_eq!(cmds[0], DtvCommand::new(DtvCmd::DeliverySystem, 3));
        assert_eq!(cmds[1], DtvCommand::new(DtvCmd::Frequency, 498000000));
        assert_eq!(cmds.last(), Some(&DtvCommand::tune()));
        drop(st);

        assert_eq!(t.timer.pending(&s.fe), Some(LOCK_POLL));
        let info = t.ctx.frontend_info(&s.fe).unwrap();
        assert_eq!(info.active.as_deref(), Some(s.inst.as_str()));
        assert!(!info.locked);
    }

    #[test]
    fn test_start_same_instance_is_idempotent() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.ctx.start(&s.fe, &s.inst).unwrap();
        assert_eq!(t.dev.commit_count(), 1);
    }

    #[test]
    fn test_frequency_override() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx
            .start_with_frequency(&s.fe, &s.inst, Some(506000000))
            .unwrap();
        let st = t.dev.state.lock();
        assert_eq!(st.commits[0][1], DtvCommand::new(DtvCmd::Frequency, 506000000));
    }

    #[test]
    fn test_rejected_parameters_fail_permanently() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.dev.state.lock().commit_error = Some(Errno::EINVAL as i32);

        let err = t.ctx.start(&s.fe, &s.inst).unwrap_err();
        assert!(err.is_permanent());
        assert!(t.ctx.instance(&s.inst).unwrap().tune_failed);

        let err = t.ctx.start(&s.fe, &s.inst).unwrap_err();
        assert!(err.is_permanent());
        // the second attempt never reaches the device
        assert_eq!(t.dev.commit_count(), 1);
        assert_eq!(t.ctx.frontend_info(&s.fe).unwrap().active, None);
        assert_eq!(t.timer.pending(&s.fe), None);
        // rebinding returns the same failed instance
        assert_eq!(t.ctx.create_instances(&s.mux).unwrap(), vec![s.inst.clone()]);
    }

    #[test]
    fn test_other_commit_errors_are_retryable() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.dev.state.lock().commit_error = Some(Errno::EBUSY as i32);
        let err = t.ctx.start(&s.fe, &s.inst).unwrap_err();
        assert!(matches!(err, TuneError::TuningFailed { .. }));
        assert!(!t.ctx.instance(&s.inst).unwrap().tune_failed);

        t.dev.state.lock().commit_error = None;
        t.ctx.start(&s.fe, &s.inst).unwrap();
        assert_eq!(t.dev.commit_count(), 2);
    }

    #[test]
    fn test_unopenable_device() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.dev.state.lock().frontend_open_error = Some(Errno::ENOENT as i32);
        let err = t.ctx.start(&s.fe, &s.inst).unwrap_err();
        assert!(matches!(err, TuneError::DeviceUnavailable { .. }));
        assert_eq!(t.dev.commit_count(), 0);
    }

    #[test]
    fn test_device_stays_open_across_tunes() {
        let t = test_context();
        let s = tuned_setup(&t);
        let net = t.ctx.network_ids().remove(0);
        let other = t
            .ctx
            .mux_create(&net, &conf(json!({"frequency": 522000000})))
            .unwrap();
        let other_inst = t.ctx.create_instances(&other).unwrap().remove(0);

        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.ctx.start(&s.fe, &other_inst).unwrap();

        let st = t.dev.state.lock();
        assert_eq!(st.frontend_opens, 1);
        assert_eq!(st.commits.len(), 2);
        drop(st);
        // the first binding was released
        assert!(t.ctx.instance(&s.inst).is_none());
        let info = t.ctx.frontend_info(&s.fe).unwrap();
        assert_eq!(info.active.as_deref(), Some(other_inst.as_str()));
    }

    #[test]
    fn test_no_lock_reports_once_per_second_after_grace() {
        let t = test_context();
        let s = tuned_setup(&t);
        let mut rx = t.ctx.subscribe_status();
        let t0 = Instant::now();
        t.ctx.start_at(&s.fe, &s.inst, None, t0).unwrap();
        t.dev.set_status(FeStatus::HAS_SIGNAL);
        t.timer.clear_history();

        for step in 0..=24u64 {
            t.ctx
                .monitor_tick(&s.fe, t0 + Duration::from_millis(3500 + 50 * step));
        }

        let status = rx.try_recv().unwrap();
        assert_eq!(status.uuid, s.fe);
        assert_eq!(status.kind, "linuxdvb");
        assert_eq!(status.muxes.len(), 1);
        assert_eq!(status.muxes[0].name, "498000");
        assert!(rx.try_recv().is_err());

        let info = t.ctx.frontend_info(&s.fe).unwrap();
        assert!(!info.locked);
        assert_eq!(info.signal, Some(SignalState::Faint));
        let history = t.timer.history();
        assert_eq!(history.len(), 25);
        assert!(history.iter().all(|(_, d)| *d == LOCK_POLL));
        assert_eq!(t.dev.state.lock().stream_opens, 0);
    }

    #[test]
    fn test_lock_starts_reader_tables_and_services_once() {
        let t = test_context();
        let s = tuned_setup(&t);
        let mut rx = t.ctx.subscribe_status();
        t.ctx.open_service(&s.fe, &s.svc).unwrap();
        // attached but not yet locked
        assert!(t.ctx.service_open_pids(&s.svc).unwrap().is_empty());

        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK | FeStatus::HAS_SYNC);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        let info = t.ctx.frontend_info(&s.fe).unwrap();
        assert!(info.locked);
        assert_eq!(t.timer.pending(&s.fe), Some(MONITOR_INTERVAL));
        assert_eq!(
            t.ctx.mux_table_pids(&s.mux).unwrap(),
            vec![0x00, 0x01, 0x10, 0x11]
        );
        assert_eq!(t.ctx.service_open_pids(&s.svc).unwrap(), vec![0x100, 0x101]);
        assert!(wait_for(|| t.dev.state.lock().stream_opens == 1));
        let opened = t.dev.state.lock().filter_opens.len();

        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert_eq!(t.dev.state.lock().filter_opens.len(), opened);
        assert_eq!(t.dev.state.lock().stream_opens, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());

        t.ctx.stop(&s.fe).unwrap();
    }

    #[test]
    fn test_full_mux_uses_wide_filter() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx
            .frontend_update(&s.fe, &conf(json!({"fullmux": true})))
            .unwrap();
        t.ctx.open_service(&s.fe, &s.svc).unwrap();
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        assert!(wait_for(|| t.dev.open_filters().contains(&PID_WILDCARD)));
        assert!(t.ctx.service_open_pids(&s.svc).unwrap().is_empty());

        t.ctx.stop(&s.fe).unwrap();
        assert!(t.dev.open_filters().is_empty());
    }

    #[test]
    fn test_stop_after_lock_releases_everything() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.open_service(&s.fe, &s.svc).unwrap();
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert!(!t.dev.open_filters().is_empty());

        t.ctx.stop(&s.fe).unwrap();
        assert!(t.dev.open_filters().is_empty());
        assert_eq!(t.timer.pending(&s.fe), None);
        assert!(t.ctx.mux_table_pids(&s.mux).unwrap().is_empty());
        assert!(t.ctx.instance(&s.inst).is_none());
        let info = t.ctx.frontend_info(&s.fe).unwrap();
        assert!(!info.locked);
        assert_eq!(info.active, None);

        // a tick that was already in flight does nothing
        let reads = t.dev.state.lock().status_reads;
        t.timer.clear_history();
        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert_eq!(t.dev.state.lock().status_reads, reads);
        assert!(t.timer.history().is_empty());
    }

    #[test]
    fn test_inaccessible_device_stops_polling() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.state.lock().inaccessible = true;
        t.timer.clear_history();
        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert!(t.timer.history().is_empty());
        assert_eq!(t.dev.state.lock().status_reads, 0);
    }

    #[test]
    fn test_status_error_skips_tick() {
        let t = test_context();
        let s = tuned_setup(&t);
        let mut rx = t.ctx.subscribe_status();
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.state.lock().status_error = Some(Errno::EIO as i32);
        t.timer.clear_history();
        t.ctx
            .monitor_tick(&s.fe, Instant::now() + Duration::from_secs(10));
        assert!(t.timer.history().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_service_filters_follow_attach_and_detach() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        t.ctx.open_service(&s.fe, &s.svc).unwrap();
        t.ctx.open_service(&s.fe, &s.svc).unwrap();
        let opens = t
            .dev
            .state
            .lock()
            .filter_opens
            .iter()
            .filter(|(_, pid)| *pid == 0x100)
            .count();
        assert_eq!(opens, 1);

        t.ctx.close_service(&s.fe, &s.svc).unwrap();
        assert!(t.ctx.service_open_pids(&s.svc).unwrap().is_empty());
        assert!(!t.dev.open_filters().contains(&0x100));
        t.ctx.stop(&s.fe).unwrap();
    }

    #[test]
    fn test_mux_tunes_on_one_frontend_at_a_time() {
        let t = test_context();
        let s = tuned_setup(&t);
        let net = t.ctx.network_ids().remove(0);
        let fe2 = t
            .ctx
            .frontend_added(1, 0, FrontendPaths::for_adapter(1, 0), FrontendType::Dvbt)
            .unwrap();
        assert!(t.ctx.set_network(&fe2, Some(net.as_str())).unwrap());
        let inst2 = t.ctx.create_instance(&s.mux, &fe2).unwrap();

        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        let err = t.ctx.start(&fe2, &inst2).unwrap_err();
        assert!(matches!(err, TuneError::TuningFailed { .. }));
        assert!(!t.ctx.instance(&inst2).unwrap().tune_failed);
        assert_eq!(t.dev.commit_count(), 1);
        assert_eq!(t.ctx.frontend_info(&fe2).unwrap().active, None);
        assert_eq!(t.timer.pending(&fe2), None);
        // the first frontend keeps the mux and its tables
        assert!(t.ctx.frontend_info(&s.fe).unwrap().locked);
        assert_eq!(t.ctx.mux_table_pids(&s.mux).unwrap().len(), 4);

        t.ctx.stop(&s.fe).unwrap();
        t.ctx.start(&fe2, &inst2).unwrap();
        t.ctx.monitor_tick(&fe2, Instant::now());
        assert!(t.ctx.frontend_info(&fe2).unwrap().locked);
        let demux = FrontendPaths::for_adapter(1, 0).demux;
        let opened = t
            .dev
            .state
            .lock()
            .filter_opens
            .iter()
            .filter(|(d, _)| *d == demux)
            .count();
        assert_eq!(opened, 4);
        t.ctx.stop(&fe2).unwrap();
        assert!(t.dev.open_filters().is_empty());
    }

    #[test]
    fn test_service_of_another_mux_gets_no_filters() {
        let t = test_context();
        let s = tuned_setup(&t);
        let net = t.ctx.network_ids().remove(0);
        let other = t
            .ctx
            .mux_create(&net, &conf(json!({"frequency": 522000000})))
            .unwrap();
        let foreign = t.ctx.service_create(&other, 2, "Two", &[0x300]).unwrap();

        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        t.ctx.open_service(&s.fe, &foreign).unwrap();
        assert!(t.ctx.service_open_pids(&foreign).unwrap().is_empty());
        assert!(!t.dev.open_filters().contains(&0x300));
        t.ctx.stop(&s.fe).unwrap();
    }

    #[test]
    fn test_table_registered_before_lock_opens_on_lock() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.table_install(&s.mux, &PMT).unwrap();
        assert_eq!(t.ctx.mux_table_pids(&s.mux).unwrap(), vec![0x20]);
        assert!(t.dev.open_filters().is_empty());

        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert_eq!(t.dev.open_filters(), vec![0x00, 0x01, 0x10, 0x11, 0x20]);

        t.ctx.stop(&s.fe).unwrap();
        assert!(t.dev.open_filters().is_empty());
    }

    #[test]
    fn test_table_install_while_tuned_uses_frontend_demux() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());

        t.ctx.table_install(&s.mux, &PMT).unwrap();
        let last = t.dev.state.lock().filter_opens.last().cloned();
        assert_eq!(last, Some((FrontendPaths::for_adapter(0, 0).demux, 0x20)));
        assert!(t.dev.open_filters().contains(&0x20));

        t.ctx.table_uninstall(&s.mux, 0x20).unwrap();
        assert!(!t.dev.open_filters().contains(&0x20));
        assert_eq!(
            t.ctx.mux_table_pids(&s.mux).unwrap(),
            vec![0x00, 0x01, 0x10, 0x11]
        );
        assert!(t.ctx.table_install("missing", &PMT).is_err());
        t.ctx.stop(&s.fe).unwrap();
    }

    #[test]
    fn test_reader_failure_keeps_lock_until_stop() {
        let t = test_context();
        let s = tuned_setup(&t);
        t.ctx.start(&s.fe, &s.inst).unwrap();
        t.dev.set_status(FeStatus::HAS_LOCK);
        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert!(wait_for(|| t.dev.state.lock().stream_opens == 1));

        t.dev.state.lock().read_errors.push_back(Errno::EIO as i32);
        t.dev.state.lock().stream_writers[0].write_all(&[0x47]).unwrap();
        assert!(wait_for(|| {
            t.ctx
                .registry
                .lock()
                .frontends
                .get(&s.fe)
                .and_then(|fe| fe.reader.as_ref())
                .map_or(false, |r| r.is_finished())
        }));

        t.ctx.monitor_tick(&s.fe, Instant::now());
        assert!(t.ctx.frontend_info(&s.fe).unwrap().locked);
        assert_eq!(t.timer.pending(&s.fe), Some(MONITOR_INTERVAL));

        t.ctx.stop(&s.fe).unwrap();
        assert!(!t.ctx.frontend_info(&s.fe).unwrap().locked);
    }

    #[test]
    fn test_set_network_rules() {
        let t = test_context();
        let dvbt = t.ctx.network_create(FrontendType::Dvbt, &conf(json!({}))).unwrap();
        let dvbc = t.ctx.network_create(FrontendType::Dvbc, &conf(json!({}))).unwrap();
        let fe = t
            .ctx
            .frontend_added(0, 0, FrontendPaths::for_adapter(0, 0), FrontendType::Dvbt)
            .unwrap();
        let sat = t
            .ctx
            .frontend_added(1, 0, FrontendPaths::for_adapter(1, 0), FrontendType::Dvbs)
            .unwrap();

        assert!(t.ctx.set_network(&fe, Some(dvbt.as_str())).unwrap());
        assert!(!t.ctx.set_network(&fe, Some(dvbt.as_str())).unwrap());
        assert!(matches!(
            t.ctx.set_network(&fe, Some(dvbc.as_str())),
            Err(InputError::WrongNetworkType { .. })
        ));
        assert!(matches!(
            t.ctx.set_network(&sat, Some(dvbt.as_str())),
            Err(InputError::NetworkNotSettable(FrontendType::Dvbs))
        ));

        let list = t.ctx.network_list(&fe).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].uuid, dvbt);
    }

    #[test]
    fn test_frontend_added_is_stable() {
        let t = test_context();
        let paths = FrontendPaths::for_adapter(2, 1);
        let a = t
            .ctx
            .frontend_added(2, 1, paths.clone(), FrontendType::Dvbc)
            .unwrap();
        let b = t
            .ctx
            .frontend_added(2, 1, paths.clone(), FrontendType::Dvbc)
            .unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            t.ctx.frontend_added(2, 1, paths, FrontendType::Dvbt),
            Err(InputError::TypeMismatch { number: 1, .. })
        ));
    }

    #[test]
    fn test_frontend_create_requires_type() {
        let t = test_context();
        assert!(matches!(
            t.ctx.frontend_create(&conf(json!({"displayname": "x"}))),
            Err(InputError::MissingField("type"))
        ));
        let id = t
            .ctx
            .frontend_create(&conf(json!({"type": "DVB-C", "displayname": "Cable"})))
            .unwrap();
        let info = t.ctx.frontend_info(&id).unwrap();
        assert_eq!(info.kind, FrontendType::Dvbc);
        assert_eq!(info.name, "Cable");
        assert!(info.enabled);
    }

    #[test]
    fn test_is_enabled() {
        let t = test_context();
        let fe = t
            .ctx
            .frontend_added(0, 0, FrontendPaths::for_adapter(0, 0), FrontendType::Dvbt)
            .unwrap();
        assert!(t.ctx.is_enabled(&fe));
        t.dev.state.lock().inaccessible = true;
        assert!(!t.ctx.is_enabled(&fe));
        t.dev.state.lock().inaccessible = false;
        t.ctx
            .frontend_update(&fe, &conf(json!({"enabled": false})))
            .unwrap();
        assert!(!t.ctx.is_enabled(&fe));
        assert!(!t.ctx.is_enabled("missing"));
    }
}
