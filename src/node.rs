//! N-API bindings for Node.js integration.
//!
//! `ArtikLoop` owns a host loop running on its own thread and the bridge to
//! a main context. `ArtikFeature` is a feature wrapper whose listeners are
//! JavaScript functions; events reach them through a threadsafe function
//! called from the host loop thread.

use crate::bridge::LoopBridge;
use crate::config::{BridgeConfig, WakeStrategy, DEFAULT_LOG_FILTER};
use crate::error::BridgeError;
use crate::feature::FeatureWrapper;
use crate::foreign::MainContext;
use crate::host::{EventLoop, HostLoop, LoopThread};
use crate::trampoline::Delivery;
use napi::bindgen_prelude::*;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::{CallContext, JsFunction, JsUnknown, Ref, Status};
use napi_derive::napi;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

impl From<BridgeError> for napi::Error {
    fn from(e: BridgeError) -> Self {
        napi::Error::from_reason(e.to_host_reason())
    }
}

/// JavaScript-friendly configuration
#[napi(object)]
pub struct JsBridgeConfig {
    /// "busyPoll" or "wakeup"
    pub wake_strategy: Option<String>,
    /// Queue capacity per listener
    pub channel_capacity: Option<u32>,
    /// Events delivered per listener per loop iteration
    pub dispatch_budget: Option<u32>,
    /// Tracing filter installed by the constructor when RUST_LOG is unset
    pub log_filter: Option<String>,
}

impl TryFrom<JsBridgeConfig> for BridgeConfig {
    type Error = BridgeError;

    fn try_from(js: JsBridgeConfig) -> std::result::Result<Self, BridgeError> {
        let mut config = BridgeConfig::default();

        if let Some(strategy) = js.wake_strategy {
            config.wake_strategy = strategy.parse::<WakeStrategy>()?;
        }
        if let Some(capacity) = js.channel_capacity {
            config.channel_capacity = capacity as usize;
        }
        if let Some(budget) = js.dispatch_budget {
            config.dispatch_budget = budget as usize;
        }
        if let Some(filter) = js.log_filter {
            config.log_filter = filter;
        }

        config.validate()?;
        Ok(config)
    }
}

/// JavaScript-friendly bridge statistics
#[napi(object)]
pub struct JsBridgeStats {
    /// Current refcount
    pub refcount: u32,
    /// Whether the main context is registered with the host loop
    pub attached: bool,
    /// RFC 3339 timestamp of the current attachment
    pub attached_since: Option<String>,
    /// Keep-alive strategy in use
    pub wake_strategy: String,
    /// Sources attached to the main context
    pub sources: u32,
    /// Poll steps run so far
    pub ticks: i64,
}

struct LoopInner {
    thread: LoopThread,
    config: BridgeConfig,
}

/// A host loop thread bridged to a main context, exposed to Node.js
#[napi]
pub struct ArtikLoop {
    bridge: Arc<LoopBridge>,
    event_loop: Arc<EventLoop>,
    inner: Mutex<Option<LoopInner>>,
}

#[napi]
impl ArtikLoop {
    /// Start a host loop thread with the given configuration
    #[napi(constructor)]
    pub fn new(config: Option<JsBridgeConfig>) -> Result<Self> {
        let config = match config {
            Some(js) => BridgeConfig::try_from(js)?,
            None => BridgeConfig::default(),
        };
        if !config.install_logging()? {
            debug!("Tracing subscriber already installed, keeping it");
        }

        let event_loop = Arc::new(EventLoop::new());
        let host: Arc<dyn HostLoop> = Arc::clone(&event_loop) as Arc<dyn HostLoop>;
        let context = Arc::new(MainContext::with_budget(config.dispatch_budget));
        let bridge = LoopBridge::new(host, context, config.wake_strategy);

        let thread = LoopThread::spawn(Arc::clone(&event_loop), "artik-loop")
            .map_err(BridgeError::from)?;

        Ok(Self {
            bridge,
            event_loop,
            inner: Mutex::new(Some(LoopInner { thread, config })),
        })
    }

    /// Take a bridge reference
    #[napi]
    pub fn attach(&self) -> Result<()> {
        self.ensure_running()?;
        self.bridge.attach();
        Ok(())
    }

    /// Release a bridge reference
    #[napi]
    pub fn detach(&self) {
        self.bridge.detach();
    }

    /// Current refcount
    #[napi(getter)]
    pub fn refcount(&self) -> u32 {
        self.bridge.refcount()
    }

    /// Whether the main context is registered with the host loop
    #[napi(getter)]
    pub fn is_attached(&self) -> bool {
        self.bridge.is_attached()
    }

    /// Host loop iterations so far
    #[napi(getter)]
    pub fn iterations(&self) -> i64 {
        self.event_loop.iterations() as i64
    }

    /// Create a feature wrapper holding a bridge reference
    #[napi]
    pub fn feature(&self, name: String) -> Result<ArtikFeature> {
        let capacity = {
            let inner = self.inner.lock();
            match inner.as_ref() {
                Some(inner) => inner.config.channel_capacity,
                None => return Err(BridgeError::Closed("loop has been shut down".into()).into()),
            }
        };

        Ok(ArtikFeature::new(FeatureWrapper::new(&self.bridge, name, capacity)))
    }

    /// Bridge statistics
    #[napi]
    pub fn get_stats(&self) -> JsBridgeStats {
        let stats = self.bridge.stats();

        JsBridgeStats {
            refcount: stats.refcount,
            attached: stats.attached,
            attached_since: stats.attached_since.map(|t| t.to_rfc3339()),
            wake_strategy: stats.wake_strategy.to_string(),
            sources: stats.sources as u32,
            ticks: stats.ticks as i64,
        }
    }

    /// Prometheus metrics
    #[napi]
    pub fn get_prometheus_metrics(&self) -> String {
        self.bridge.metrics().to_prometheus()
    }

    /// Stop the host loop thread. Idempotent.
    #[napi]
    pub fn shutdown(&self) {
        let inner = self.inner.lock().take();
        if let Some(mut inner) = inner {
            if self.bridge.refcount() > 0 {
                warn!(refcount = self.bridge.refcount(), "Shutting down an attached loop");
            }
            inner.thread.stop();
            debug!("Host loop thread stopped");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.lock().is_none() {
            return Err(BridgeError::Closed("loop has been shut down".into()).into());
        }
        Ok(())
    }
}

type JsListener = ThreadsafeFunction<serde_json::Value, ErrorStrategy::Fatal>;

/// A listener owned by the JavaScript thread.
///
/// Calls queued on a threadsafe function before `off` still arrive after it,
/// so every call checks the slot first. Revoking happens on the same thread,
/// which makes a revoked listener unreachable from then on.
struct ListenerSlot<T>(Rc<RefCell<Option<T>>>);

impl<T> ListenerSlot<T> {
    fn new(listener: T) -> Self {
        Self(Rc::new(RefCell::new(Some(listener))))
    }

    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0.borrow().as_ref().map(f)
    }

    fn revoke(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }
}

impl<T> Clone for ListenerSlot<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

fn release(env: Env, slot: &ListenerSlot<Ref<()>>) -> Result<()> {
    if let Some(reference) = slot.revoke() {
        reference.unref(env)?;
    }
    Ok(())
}

/// Feature wrapper whose listeners are JavaScript functions
#[napi(custom_finalize)]
pub struct ArtikFeature {
    inner: Mutex<Option<FeatureWrapper<serde_json::Value>>>,
    listeners: RefCell<HashMap<String, ListenerSlot<Ref<()>>>>,
}

#[napi]
impl ArtikFeature {
    fn new(feature: FeatureWrapper<serde_json::Value>) -> Self {
        Self {
            inner: Mutex::new(Some(feature)),
            listeners: RefCell::new(HashMap::new()),
        }
    }

    /// Register `callback` for `event`, replacing any previous listener
    #[napi]
    pub fn on(
        &self,
        env: Env,
        event: String,
        #[napi(ts_arg_type = "(payload: any) => void")] callback: JsFunction,
    ) -> Result<()> {
        let slot = ListenerSlot::new(env.create_reference(callback)?);
        if let Err(e) = self.register(env, &event, &slot) {
            release(env, &slot)?;
            return Err(e);
        }

        let previous = self.listeners.borrow_mut().insert(event, slot);
        if let Some(previous) = previous {
            release(env, &previous)?;
        }
        Ok(())
    }

    fn register(&self, env: Env, event: &str, slot: &ListenerSlot<Ref<()>>) -> Result<()> {
        let gate_slot = slot.clone();
        let gate = env.create_function_from_closure("artikListener", move |ctx: CallContext<'_>| {
            let listener = match gate_slot.with(|r| ctx.env.get_reference_value::<JsFunction>(r)) {
                Some(listener) => listener?,
                None => return ctx.env.get_undefined(),
            };
            let payload = ctx.get::<JsUnknown>(0)?;
            listener.call(None, &[payload])?;
            ctx.env.get_undefined()
        })?;

        let tsfn: JsListener = gate.create_threadsafe_function(
            0,
            |ctx: ThreadSafeCallContext<serde_json::Value>| {
                let value = ctx.env.to_js_value(&ctx.value)?;
                Ok(vec![value])
            },
        )?;

        let mut inner = self.inner.lock();
        let feature = inner
            .as_mut()
            .ok_or_else(|| BridgeError::Closed("feature has been closed".into()))?;

        let event_name = event.to_string();
        feature.on(event, move |payload: serde_json::Value| {
            let status = tsfn.call(payload, ThreadsafeFunctionCallMode::NonBlocking);
            if status != Status::Ok {
                warn!(event = %event_name, ?status, "Failed to queue JavaScript listener call");
            }
        })?;

        Ok(())
    }

    /// Unregister the listener for `event`. Calls already queued for it are
    /// discarded.
    #[napi]
    pub fn off(&self, env: Env, event: String) -> Result<bool> {
        let slot = self.listeners.borrow_mut().remove(&event);
        if let Some(slot) = slot {
            release(env, &slot)?;
        }

        Ok(match self.inner.lock().as_mut() {
            Some(feature) => feature.off(&event),
            None => false,
        })
    }

    /// Deliver `payload` to the listener for `event` on the next loop
    /// iteration. Returns "queued", "full" or "dropped".
    #[napi]
    pub fn emit(&self, event: String, payload: serde_json::Value) -> String {
        let delivery = match self.inner.lock().as_ref() {
            Some(feature) => feature.emit(&event, payload),
            None => Delivery::Dropped,
        };
        delivery.to_string()
    }

    /// Feature name
    #[napi(getter)]
    pub fn name(&self) -> Option<String> {
        self.inner.lock().as_ref().map(|f| f.name().to_string())
    }

    /// Number of registered listeners
    #[napi(getter)]
    pub fn listener_count(&self) -> u32 {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |f| f.listener_count() as u32)
    }

    /// Unregister all listeners and release the bridge reference
    #[napi]
    pub fn close(&self, env: Env) -> Result<()> {
        let feature = self.inner.lock().take();
        // Dropped outside the lock
        drop(feature);
        self.release_all(env)
    }

    fn release_all(&self, env: Env) -> Result<()> {
        let slots: Vec<_> = self.listeners.borrow_mut().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            release(env, slot)?;
        }
        Ok(())
    }
}

impl ObjectFinalize for ArtikFeature {
    fn finalize(self, env: Env) -> Result<()> {
        self.release_all(env)
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over `log_filter`.
#[napi]
pub fn init(log_filter: Option<String>) -> Result<()> {
    let filter = log_filter.unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    if !crate::init_logging(&filter)? {
        debug!("Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_conversion() {
        let js_config = JsBridgeConfig {
            wake_strategy: Some("wakeup".to_string()),
            channel_capacity: Some(128),
            dispatch_budget: Some(8),
            log_filter: None,
        };

        let config = BridgeConfig::try_from(js_config).unwrap();
        assert_eq!(config.wake_strategy, WakeStrategy::Wakeup);
        assert_eq!(config.channel_capacity, 128);
        assert_eq!(config.dispatch_budget, 8);
    }

    #[test]
    fn test_config_conversion_rejects_bad_values() {
        let js_config = JsBridgeConfig {
            wake_strategy: Some("spin".to_string()),
            channel_capacity: None,
            dispatch_budget: None,
            log_filter: None,
        };
        assert!(BridgeConfig::try_from(js_config).is_err());

        let js_config = JsBridgeConfig {
            wake_strategy: None,
            channel_capacity: Some(0),
            dispatch_budget: None,
            log_filter: None,
        };
        let err = BridgeConfig::try_from(js_config).unwrap_err();
        assert!(err.to_host_reason().starts_with("[INVALID_CONFIG]"));
    }

    #[test]
    fn test_revoked_listener_slot_is_unreachable() {
        let slot = ListenerSlot::new(String::from("listener"));
        let gate = slot.clone();

        assert_eq!(gate.with(|l| l.len()), Some(8));
        assert_eq!(slot.revoke().as_deref(), Some("listener"));

        // Every copy sees the revocation
        assert_eq!(gate.with(|l| l.len()), None);
        assert!(gate.revoke().is_none());
    }

    #[test]
    fn test_listener_slot_revoked_from_inside_call() {
        let slot = ListenerSlot::new(7u32);
        let gate = slot.clone();

        let value = gate.with(|v| *v);
        // The borrow is released before the listener runs, so it may revoke itself
        assert_eq!(slot.revoke(), Some(7));
        assert_eq!(value, Some(7));
        assert_eq!(gate.with(|v| *v), None);
    }
}
