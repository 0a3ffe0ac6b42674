//! Callback trampolines.
//!
//! An SDK callback fires on whatever thread the SDK chooses. A trampoline
//! turns that call into a message on a bounded queue; the queue is drained by
//! a `ChannelSource` inside the main context, so the listener only ever runs
//! during a host-loop iteration. Unregistering revokes the listener before the
//! next event, even in the middle of a batch, then removes the source. Events
//! still queued or sent afterwards are dropped silently.

use crate::foreign::{ChannelSource, MainContext, SourceId};
use crate::metrics::BridgeMetrics;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Outcome of handing an event to a trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    /// Queued for the next loop iteration
    Queued,
    /// Queue at capacity; the event was discarded
    Full,
    /// No listener registered; the event was discarded
    Dropped,
}

impl std::fmt::Display for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Queued => write!(f, "queued"),
            Delivery::Full => write!(f, "full"),
            Delivery::Dropped => write!(f, "dropped"),
        }
    }
}

/// Registration of a host listener with a main context
pub struct Trampoline<T> {
    source: SourceId,
    context: Weak<MainContext>,
    active: Arc<AtomicBool>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Trampoline<T> {
    /// Register `listener` with `context`.
    ///
    /// Returns the registration and the sender SDK callbacks use to deliver
    /// events. `capacity` is the queue size and must be non-zero.
    pub fn register<F>(
        context: &Arc<MainContext>,
        capacity: usize,
        listener: F,
    ) -> (Self, TrampolineSender<T>)
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = ChannelSource::new(
            rx,
            context.dispatch_budget(),
            Arc::clone(context.metrics()),
            listener,
        )
        .with_name("trampoline");
        let active = source.active_flag();
        let id = context.attach(source);

        debug!(source_id = %id, capacity = capacity, "Trampoline registered");

        let sender = TrampolineSender {
            tx,
            source: id,
            context: Arc::downgrade(context),
            active: Arc::clone(&active),
            metrics: Arc::clone(context.metrics()),
        };

        (
            Self {
                source: id,
                context: Arc::downgrade(context),
                active,
                _payload: PhantomData,
            },
            sender,
        )
    }
}

impl<T> Trampoline<T> {
    /// Source backing this trampoline
    pub fn source_id(&self) -> SourceId {
        self.source
    }

    /// Whether the listener can still be invoked
    pub fn is_registered(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && self
                .context
                .upgrade()
                .map_or(false, |context| context.contains(self.source))
    }

    /// Remove the native-side registration, releasing the listener.
    ///
    /// Idempotent. Events already queued are discarded, including the rest
    /// of a batch being dispatched right now.
    pub fn unregister(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(context) = self.context.upgrade() {
            let removed = context.remove(self.source);
            debug!(source_id = %self.source, removed = removed, "Trampoline unregistered");
        }
    }
}

impl<T> Drop for Trampoline<T> {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Thread-safe entry point SDK callbacks use to reach a listener
pub struct TrampolineSender<T> {
    tx: mpsc::Sender<T>,
    source: SourceId,
    context: Weak<MainContext>,
    active: Arc<AtomicBool>,
    metrics: Arc<BridgeMetrics>,
}

impl<T> Clone for TrampolineSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            source: self.source,
            context: Weak::clone(&self.context),
            active: Arc::clone(&self.active),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<T> TrampolineSender<T> {
    /// Queue an event for the listener and wake the context. Never blocks.
    pub fn send(&self, payload: T) -> Delivery {
        if !self.active.load(Ordering::Acquire) {
            self.metrics.record_event_dropped();
            trace!(source_id = %self.source, "Listener unregistered, dropping event");
            return Delivery::Dropped;
        }
        match self.tx.try_send(payload) {
            Ok(()) => {
                if let Some(context) = self.context.upgrade() {
                    context.wakeup();
                }
                trace!(source_id = %self.source, "Event queued");
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_queue_full();
                warn!(source_id = %self.source, "Listener queue full, dropping event");
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_event_dropped();
                trace!(source_id = %self.source, "Listener gone, dropping event");
                Delivery::Dropped
            }
        }
    }

    /// Whether the listener has been released
    pub fn is_closed(&self) -> bool {
        !self.active.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Source this sender delivers to
    pub fn source_id(&self) -> SourceId {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collecting(
        context: &Arc<MainContext>,
        capacity: usize,
    ) -> (Trampoline<u8>, TrampolineSender<u8>, Arc<Mutex<Vec<u8>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        let (trampoline, sender) =
            Trampoline::register(context, capacity, move |value| r.lock().push(value));
        (trampoline, sender, received)
    }

    #[test]
    fn test_event_delivered_on_iteration() {
        let context = Arc::new(MainContext::new());
        let (trampoline, sender, received) = collecting(&context, 4);
        assert!(trampoline.is_registered());

        assert_eq!(sender.send(1), Delivery::Queued);
        assert_eq!(sender.send(2), Delivery::Queued);
        // Nothing runs until the context iterates
        assert!(received.lock().is_empty());

        assert!(context.iteration(false));
        assert_eq!(*received.lock(), vec![1, 2]);
    }

    #[test]
    fn test_unregister_then_send_is_silent() {
        let context = Arc::new(MainContext::new());
        let (mut trampoline, sender, received) = collecting(&context, 4);

        sender.send(1);
        trampoline.unregister();
        assert!(!trampoline.is_registered());
        assert!(sender.is_closed());

        assert_eq!(sender.send(2), Delivery::Dropped);
        assert!(!context.iteration(false));
        assert!(received.lock().is_empty());
        assert_eq!(context.metrics().snapshot().events_dropped, 1);

        // Second unregister is a no-op
        trampoline.unregister();
    }

    #[test]
    fn test_drop_unregisters() {
        let context = Arc::new(MainContext::new());
        let (trampoline, sender, _received) = collecting(&context, 4);
        let id = trampoline.source_id();

        drop(trampoline);
        assert!(!context.contains(id));
        assert_eq!(sender.send(9), Delivery::Dropped);
    }

    #[test]
    fn test_full_queue() {
        let context = Arc::new(MainContext::new());
        let (_trampoline, sender, received) = collecting(&context, 1);

        assert_eq!(sender.send(1), Delivery::Queued);
        assert_eq!(sender.send(2), Delivery::Full);
        assert_eq!(context.metrics().snapshot().queue_full, 1);

        context.iteration(false);
        assert_eq!(*received.lock(), vec![1]);
    }

    #[test]
    fn test_send_from_foreign_thread() {
        let context = Arc::new(MainContext::new());
        let (_trampoline, sender, received) = collecting(&context, 16);

        let worker = std::thread::spawn(move || {
            for value in 0..10 {
                assert_eq!(sender.send(value), Delivery::Queued);
            }
        });
        worker.join().unwrap();

        while context.iteration(false) {}
        assert_eq!(*received.lock(), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_unregister_sibling_in_same_pass() {
        let context = Arc::new(MainContext::new());
        let slot: Arc<Mutex<Option<Trampoline<u8>>>> = Arc::new(Mutex::new(None));

        let victim = Arc::clone(&slot);
        let (_first, first_tx) = Trampoline::register(&context, 4, move |_: u8| {
            // Dropping the registration unregisters it
            victim.lock().take();
        });
        let (second, second_tx, second_rx) = collecting(&context, 4);
        *slot.lock() = Some(second);

        first_tx.send(1);
        second_tx.send(2);

        context.iteration(false);
        assert!(second_rx.lock().is_empty());
        assert_eq!(second_tx.send(3), Delivery::Dropped);
    }

    #[test]
    fn test_self_unregister_discards_rest_of_batch() {
        let context = Arc::new(MainContext::new());
        let slot: Arc<Mutex<Option<Trampoline<u8>>>> = Arc::new(Mutex::new(None));
        let received = Arc::new(Mutex::new(Vec::new()));

        let own = Arc::clone(&slot);
        let r = Arc::clone(&received);
        let (trampoline, sender) = Trampoline::register(&context, 8, move |value: u8| {
            r.lock().push(value);
            own.lock().take();
        });
        *slot.lock() = Some(trampoline);

        for value in 1..=3 {
            assert_eq!(sender.send(value), Delivery::Queued);
        }
        context.iteration(false);

        assert_eq!(*received.lock(), vec![1]);
        assert_eq!(sender.send(4), Delivery::Dropped);
        assert!(context.is_empty());
    }

    #[test]
    fn test_unregister_from_other_thread_mid_batch() {
        let context = Arc::new(MainContext::new());
        let slot: Arc<Mutex<Option<Trampoline<u8>>>> = Arc::new(Mutex::new(None));
        let received = Arc::new(Mutex::new(Vec::new()));

        let own = Arc::clone(&slot);
        let r = Arc::clone(&received);
        let (trampoline, sender) = Trampoline::register(&context, 8, move |value: u8| {
            r.lock().push(value);
            let victim = Arc::clone(&own);
            // Unregister on another thread and wait for it to finish
            std::thread::spawn(move || {
                if let Some(mut trampoline) = victim.lock().take() {
                    trampoline.unregister();
                }
            })
            .join()
            .unwrap();
        });
        *slot.lock() = Some(trampoline);

        sender.send(1);
        sender.send(2);
        context.iteration(false);

        assert_eq!(*received.lock(), vec![1]);
        assert!(sender.is_closed());
    }
}
