//! Monitor timer dispatch.
//!
//! Each frontend has at most one pending monitor tick. Arming replaces the
//! pending tick, disarming cancels it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::context::Context;

/// Schedules `Context::monitor_tick` calls.
pub trait MonitorTimer: Send + Sync {
    fn arm(&self, ctx: Weak<Context>, frontend: &str, delay: Duration);

    fn disarm(&self, frontend: &str);
}

/// Timer backed by tokio tasks.
///
/// Run it on a current-thread runtime to get a single-threaded dispatcher.
pub struct TokioTimer {
    handle: Handle,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTimer {
    /// Uses the runtime of the calling task.
    pub fn new() -> Arc<Self> {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            tasks: Mutex::new(HashMap::new()),
        })
    }
}

impl MonitorTimer for TokioTimer {
    fn arm(&self, ctx: Weak<Context>, frontend: &str, delay: Duration) {
        let fe = frontend.to_string();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.monitor_tick(&fe, Instant::now());
            }
        });
        if let Some(old) = self.tasks.lock().insert(frontend.to_string(), task) {
            old.abort();
        }
    }

    fn disarm(&self, frontend: &str) {
        if let Some(task) = self.tasks.lock().remove(frontend) {
            trace!("{} - monitor disarmed", frontend);
            task.abort();
        }
    }
}

/// Timer that only records requests. The owner drives ticks.
#[derive(Debug, Default)]
pub struct ManualTimer {
    pending: Mutex<HashMap<String, Duration>>,
    history: Mutex<Vec<(String, Duration)>>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay of the pending tick for `frontend`.
    pub fn pending(&self, frontend: &str) -> Option<Duration> {
        self.pending.lock().get(frontend).copied()
    }

    /// Every arm request so far.
    pub fn history(&self) -> Vec<(String, Duration)> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

impl MonitorTimer for ManualTimer {
    fn arm(&self, _ctx: Weak<Context>, frontend: &str, delay: Duration) {
        self.pending.lock().insert(frontend.to_string(), delay);
        self.history.lock().push((frontend.to_string(), delay));
    }

    fn disarm(&self, frontend: &str) {
        self.pending.lock().remove(frontend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::conf;
    use crate::device::mock::MockDevices;
    use crate::device::FrontendPaths;
    use crate::settings::MemorySettings;
    use crate::ts_sync::PacketSync;
    use dvb_protocol::{FeStatus, FrontendType};
    use serde_json::json;

    fn tuned(timer: Arc<dyn MonitorTimer>) -> (Arc<Context>, MockDevices, String) {
        let dev = MockDevices::new();
        let ctx = Context::new(
            Arc::new(dev.clone()),
            Arc::new(MemorySettings::new()),
            Arc::new(PacketSync::new()),
            timer,
        );
        let net = ctx.network_create(FrontendType::Dvbt, &conf(json!({}))).unwrap();
        let mux = ctx
            .mux_create(&net, &conf(json!({"frequency": 498000000})))
            .unwrap();
        let fe = ctx
            .frontend_added(0, 0, FrontendPaths::for_adapter(0, 0), FrontendType::Dvbt)
            .unwrap();
        ctx.set_network(&fe, Some(net.as_str())).unwrap();
        let inst = ctx.create_instances(&mux).unwrap().remove(0);
        dev.set_status(FeStatus::HAS_SIGNAL);
        ctx.start(&fe, &inst).unwrap();
        (ctx, dev, fe)
    }

    #[tokio::test]
    async fn test_tokio_timer_polls_until_stopped() {
        let (ctx, dev, fe) = tuned(TokioTimer::new());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let reads = dev.state.lock().status_reads;
        assert!(reads >= 2, "only {} status reads", reads);

        ctx.stop(&fe).unwrap();
        let reads = dev.state.lock().status_reads;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dev.state.lock().status_reads, reads);
    }

    #[tokio::test]
    async fn test_dropped_context_ends_polling() {
        let timer = TokioTimer::new();
        let (ctx, dev, _fe) = tuned(timer.clone());
        drop(ctx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dev.state.lock().status_reads, 0);
    }

    #[test]
    fn test_manual_timer_replaces_pending() {
        let timer = ManualTimer::new();
        timer.arm(Weak::new(), "fe0", Duration::from_millis(50));
        timer.arm(Weak::new(), "fe0", Duration::from_secs(1));
        assert_eq!(timer.pending("fe0"), Some(Duration::from_secs(1)));
        assert_eq!(timer.history().len(), 2);
        timer.disarm("fe0");
        assert_eq!(timer.pending("fe0"), None);
    }
}
