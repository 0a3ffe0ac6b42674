//! Feature wrappers.
//!
//! A feature wrapper stands for one SDK object seen from the host (a GPIO
//! pin, an MQTT client, a sensor). It holds a bridge reference for as long as
//! it lives and owns one trampoline per event name. Dropping the wrapper
//! unregisters every listener before releasing the bridge.

use crate::bridge::{BridgeGuard, LoopBridge};
use crate::error::{BridgeError, Result};
use crate::trampoline::{Delivery, Trampoline, TrampolineSender};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct Listener<T> {
    trampoline: Trampoline<T>,
    sender: TrampolineSender<T>,
}

/// Host-side wrapper around one SDK object
pub struct FeatureWrapper<T> {
    name: String,
    capacity: usize,
    // Declared before `guard`: listeners go first on drop
    listeners: HashMap<String, Listener<T>>,
    guard: Option<BridgeGuard>,
}

impl<T: Send + 'static> FeatureWrapper<T> {
    /// Create a wrapper and take a bridge reference
    pub fn new(bridge: &Arc<LoopBridge>, name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        debug!(feature = %name, "Feature wrapper created");

        Self {
            name,
            capacity,
            listeners: HashMap::new(),
            guard: Some(bridge.guard()),
        }
    }

    /// Feature name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    /// Register `listener` for `event`, replacing any previous listener.
    ///
    /// The previous registration is removed before the new one is created.
    pub fn on<F>(&mut self, event: impl Into<String>, listener: F) -> Result<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        let event = event.into();
        let bridge = match self.guard.as_ref() {
            Some(guard) => Arc::clone(guard.bridge()),
            None => {
                return Err(BridgeError::Closed(format!("feature '{}'", self.name)));
            }
        };

        if let Some(mut previous) = self.listeners.remove(&event) {
            previous.trampoline.unregister();
        }

        let (trampoline, sender) = Trampoline::register(bridge.context(), self.capacity, listener);
        debug!(
            feature = %self.name,
            event = %event,
            source_id = %trampoline.source_id(),
            "Listener registered"
        );
        self.listeners.insert(event, Listener { trampoline, sender });
        Ok(())
    }

    /// Unregister the listener for `event`. Returns false if there was none.
    pub fn off(&mut self, event: &str) -> bool {
        match self.listeners.remove(event) {
            Some(mut listener) => {
                listener.trampoline.unregister();
                debug!(feature = %self.name, event = %event, "Listener unregistered");
                true
            }
            None => false,
        }
    }

    /// Sender for `event`, for handing to an SDK callback
    pub fn sender(&self, event: &str) -> Option<TrampolineSender<T>> {
        self.listeners.get(event).map(|listener| listener.sender.clone())
    }

    /// Deliver an SDK event to the listener for `event`, if any
    pub fn emit(&self, event: &str, payload: T) -> Delivery {
        match self.listeners.get(event) {
            Some(listener) => listener.sender.send(payload),
            None => Delivery::Dropped,
        }
    }

    /// Registered event names
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.listeners.keys().cloned().collect();
        events.sort();
        events
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T> FeatureWrapper<T> {
    /// Unregister all listeners and release the bridge reference. Idempotent.
    pub fn close(&mut self) {
        for (_, mut listener) in self.listeners.drain() {
            listener.trampoline.unregister();
        }
        if self.guard.take().is_some() {
            debug!(feature = %self.name, "Feature wrapper closed");
        }
    }
}

impl<T> Drop for FeatureWrapper<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WakeStrategy;
    use crate::foreign::MainContext;
    use crate::host::{EventLoop, HostLoop, RunMode};
    use parking_lot::Mutex;

    fn create_bridge() -> (Arc<EventLoop>, Arc<LoopBridge>) {
        let event_loop = Arc::new(EventLoop::new());
        let host: Arc<dyn HostLoop> = Arc::clone(&event_loop) as Arc<dyn HostLoop>;
        let bridge = LoopBridge::new(host, Arc::new(MainContext::new()), WakeStrategy::BusyPoll);
        (event_loop, bridge)
    }

    #[test]
    fn test_pins_share_bridge() {
        let (_event_loop, bridge) = create_bridge();

        let pin_a = FeatureWrapper::<bool>::new(&bridge, "gpio-128", 8);
        let pin_b = FeatureWrapper::<bool>::new(&bridge, "gpio-129", 8);
        assert_eq!(bridge.refcount(), 2);

        drop(pin_a);
        assert!(bridge.is_attached());

        drop(pin_b);
        assert!(!bridge.is_attached());
    }

    #[test]
    fn test_edge_events_reach_listener() {
        let (event_loop, bridge) = create_bridge();
        let edges = Arc::new(Mutex::new(Vec::new()));

        let mut pin = FeatureWrapper::new(&bridge, "gpio-128", 8);
        let e = Arc::clone(&edges);
        pin.on("change", move |level: bool| e.lock().push(level)).unwrap();

        let sdk_callback = pin.sender("change").unwrap();
        std::thread::spawn(move || {
            sdk_callback.send(true);
            sdk_callback.send(false);
        })
        .join()
        .unwrap();

        event_loop.run(RunMode::Once);
        assert_eq!(*edges.lock(), vec![true, false]);
    }

    #[test]
    fn test_replacing_listener() {
        let (event_loop, bridge) = create_bridge();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let mut client = FeatureWrapper::new(&bridge, "mqtt", 8);
        let f = Arc::clone(&first);
        client.on("message", move |_: String| *f.lock() += 1).unwrap();
        let stale = client.sender("message").unwrap();

        let s = Arc::clone(&second);
        client.on("message", move |_: String| *s.lock() += 1).unwrap();
        assert_eq!(client.listener_count(), 1);

        assert_eq!(stale.send("old".into()), Delivery::Dropped);
        assert_eq!(client.emit("message", "new".into()), Delivery::Queued);

        event_loop.run(RunMode::Once);
        assert_eq!(*first.lock(), 0);
        assert_eq!(*second.lock(), 1);
    }

    #[test]
    fn test_off_and_unknown_event() {
        let (_event_loop, bridge) = create_bridge();
        let mut sensor = FeatureWrapper::new(&bridge, "sensor", 8);
        sensor.on("reading", |_: f64| {}).unwrap();

        assert_eq!(sensor.events(), vec!["reading".to_string()]);
        assert!(sensor.off("reading"));
        assert!(!sensor.off("reading"));
        assert_eq!(sensor.emit("reading", 1.5), Delivery::Dropped);
    }

    #[test]
    fn test_drop_unregisters_before_detach() {
        let (event_loop, bridge) = create_bridge();
        let hits = Arc::new(Mutex::new(0));

        let mut pin = FeatureWrapper::new(&bridge, "gpio-130", 8);
        let h = Arc::clone(&hits);
        pin.on("change", move |_: bool| *h.lock() += 1).unwrap();
        let sdk_callback = pin.sender("change").unwrap();

        drop(pin);
        assert!(bridge.context().is_empty());
        assert_eq!(sdk_callback.send(true), Delivery::Dropped);
        assert!(!event_loop.run(RunMode::Default));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_on_after_close_fails() {
        let (_event_loop, bridge) = create_bridge();
        let mut pin = FeatureWrapper::new(&bridge, "gpio-131", 8);
        pin.close();
        assert!(pin.is_closed());
        assert_eq!(bridge.refcount(), 0);

        let err = pin.on("change", |_: bool| {}).unwrap_err();
        assert!(matches!(err, BridgeError::Closed(_)));

        // Drop after close does not detach twice
        drop(pin);
        assert_eq!(bridge.metrics().snapshot().detach_underflows, 0);
    }
}
