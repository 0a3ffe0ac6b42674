//! The loop bridge.
//!
//! `LoopBridge` multiplexes any number of feature wrappers' need for "the main
//! context is being polled" into a single registration with the host loop.
//! The registration exists exactly while the refcount is above zero:
//!
//! ```text
//!              attach (0 -> 1): add prepare + keep-alive
//!   DETACHED  ─────────────────────────────────────────▶  ATTACHED
//!   refcount 0 ◀─────────────────────────────────────────  refcount > 0
//!              detach (1 -> 0): remove prepare + keep-alive
//! ```
//!
//! The prepare callback runs one non-blocking `MainContext::iteration` per
//! host-loop iteration. The keep-alive is either an always-ready idle handle
//! (`WakeStrategy::BusyPoll`) or a wake hook on the context
//! (`WakeStrategy::Wakeup`).

use crate::config::WakeStrategy;
use crate::foreign::MainContext;
use crate::host::{EventLoop, HandleId, HostLoop};
use crate::metrics::BridgeMetrics;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum KeepAlive {
    Idle(HandleId),
    WakeHook,
}

#[derive(Default)]
struct BridgeState {
    refcount: u32,
    prepare: Option<HandleId>,
    keep_alive: Option<KeepAlive>,
    attached_since: Option<DateTime<Utc>>,
}

/// Snapshot of the bridge state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Current refcount
    pub refcount: u32,

    /// Whether the main context is registered with the host loop
    pub attached: bool,

    /// When the current attachment began
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_since: Option<DateTime<Utc>>,

    /// Keep-alive strategy in use
    pub wake_strategy: WakeStrategy,

    /// Sources attached to the main context
    pub sources: usize,

    /// Poll steps run so far
    pub ticks: u64,
}

/// Shared, refcounted attachment of a `MainContext` to a host loop
pub struct LoopBridge {
    host: Arc<dyn HostLoop>,
    context: Arc<MainContext>,
    strategy: WakeStrategy,
    state: Mutex<BridgeState>,
}

static INSTANCE: Lazy<Arc<LoopBridge>> = Lazy::new(|| {
    let host: Arc<dyn HostLoop> = Arc::clone(EventLoop::default_loop()) as Arc<dyn HostLoop>;
    LoopBridge::new(
        host,
        Arc::clone(MainContext::default_context()),
        WakeStrategy::default(),
    )
});

impl LoopBridge {
    /// Create a bridge between `host` and `context`
    pub fn new(
        host: Arc<dyn HostLoop>,
        context: Arc<MainContext>,
        strategy: WakeStrategy,
    ) -> Arc<Self> {
        debug!(?strategy, "Creating loop bridge");

        Arc::new(Self {
            host,
            context,
            strategy,
            state: Mutex::new(BridgeState::default()),
        })
    }

    /// The process-wide bridge between the default host loop and the default
    /// main context, created on first use
    pub fn instance() -> &'static Arc<LoopBridge> {
        &INSTANCE
    }

    /// The bridged main context
    pub fn context(&self) -> &Arc<MainContext> {
        &self.context
    }

    /// Counters shared with the main context
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        self.context.metrics()
    }

    /// Current refcount
    pub fn refcount(&self) -> u32 {
        self.state.lock().refcount
    }

    /// Whether the main context is registered with the host loop
    pub fn is_attached(&self) -> bool {
        self.state.lock().prepare.is_some()
    }

    /// Take a reference. The first one registers the main context with the
    /// host loop.
    pub fn attach(&self) {
        let mut state = self.state.lock();
        state.refcount += 1;
        self.metrics().record_attach();

        if state.refcount == 1 {
            self.register(&mut state);
            info!(strategy = ?self.strategy, "Main context attached to host loop");
        } else {
            debug!(refcount = state.refcount, "Loop bridge reference taken");
        }
    }

    /// Drop a reference. The last one unregisters the main context.
    /// Detaching an already detached bridge is a no-op.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if state.refcount == 0 {
            self.metrics().record_detach_underflow();
            warn!("detach() called on a detached loop bridge");
            return;
        }

        state.refcount -= 1;
        self.metrics().record_detach();

        if state.refcount == 0 {
            self.unregister(&mut state);
            info!("Main context detached from host loop");
        } else {
            debug!(refcount = state.refcount, "Loop bridge reference released");
        }
    }

    /// Attach now, detach when the guard drops
    pub fn guard(self: &Arc<Self>) -> BridgeGuard {
        self.attach();
        BridgeGuard {
            bridge: Arc::clone(self),
        }
    }

    /// Snapshot of the bridge state
    pub fn stats(&self) -> BridgeStats {
        let (refcount, attached, attached_since) = {
            let state = self.state.lock();
            (state.refcount, state.prepare.is_some(), state.attached_since)
        };

        BridgeStats {
            refcount,
            attached,
            attached_since,
            wake_strategy: self.strategy,
            sources: self.context.len(),
            ticks: self.metrics().ticks(),
        }
    }

    fn register(&self, state: &mut BridgeState) {
        let context = Arc::clone(&self.context);
        let bound_wait = self.strategy == WakeStrategy::Wakeup;

        let prepare = self.host.add_prepare(Box::new(move || {
            context.metrics().record_tick();
            context.iteration(false);
            // Without an idle handle the host blocks; never past a timer
            if bound_wait {
                context.next_deadline()
            } else {
                None
            }
        }));

        let keep_alive = match self.strategy {
            WakeStrategy::BusyPoll => KeepAlive::Idle(self.host.add_idle(Box::new(|| {}))),
            WakeStrategy::Wakeup => {
                self.context.set_wake_hook(Some(self.host.waker()));
                KeepAlive::WakeHook
            }
        };

        state.prepare = Some(prepare);
        state.keep_alive = Some(keep_alive);
        state.attached_since = Some(Utc::now());
    }

    fn unregister(&self, state: &mut BridgeState) {
        if let Some(prepare) = state.prepare.take() {
            self.host.remove_prepare(prepare);
        }

        match state.keep_alive.take() {
            Some(KeepAlive::Idle(idle)) => {
                self.host.remove_idle(idle);
            }
            Some(KeepAlive::WakeHook) => self.context.set_wake_hook(None),
            None => {}
        }

        state.attached_since = None;
    }
}

/// RAII reference on a `LoopBridge`
pub struct BridgeGuard {
    bridge: Arc<LoopBridge>,
}

impl BridgeGuard {
    /// The bridge this guard holds a reference on
    pub fn bridge(&self) -> &Arc<LoopBridge> {
        &self.bridge
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        self.bridge.detach();
    }
}
