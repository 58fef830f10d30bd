//! Typed federation events and the bus that delivers them.
//!
//! Synchronous handlers are registered once at startup and run inline in
//! [`EventBus::publish`], before the event is broadcast to async subscribers.
//! The federation state is such a handler, so subscribers always observe
//! state that already reflects the event they receive.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::record::RegistrationRecord;
use crate::types::{NodeId, Resource};

/// Events emitted by the federation subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum FederationEvent {
    /// This node completed registration with its registrar.
    RegisteredToParent {
        /// Local mirror of the registrar.
        registrar: RegistrationRecord,
        /// This node's own record as stored at the registrar.
        own: RegistrationRecord,
    },
    /// This node is no longer registered with its registrar.
    DeregisteredFromParent {
        /// This node's last known record at the registrar, if any.
        own: Option<RegistrationRecord>,
    },
    /// A child node registered with this node.
    ChildRegistered(RegistrationRecord),
    /// A child node's registration went away.
    ChildDeregistered(RegistrationRecord),
    /// A local resource was deleted.
    ResourceDeleted(Resource),
}

impl FederationEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationEvent::RegisteredToParent { .. } => "registered-to-parent",
            FederationEvent::DeregisteredFromParent { .. } => "deregistered-from-parent",
            FederationEvent::ChildRegistered(_) => "child-registered",
            FederationEvent::ChildDeregistered(_) => "child-deregistered",
            FederationEvent::ResourceDeleted(_) => "resource-deleted",
        }
    }

    /// Remote node the event is about, if any.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            FederationEvent::RegisteredToParent { registrar, .. } => Some(&registrar.node_id),
            FederationEvent::DeregisteredFromParent { .. } => None,
            FederationEvent::ChildRegistered(r) | FederationEvent::ChildDeregistered(r) => {
                Some(&r.node_id)
            }
            FederationEvent::ResourceDeleted(_) => None,
        }
    }
}

/// Synchronous event handler registered at startup.
pub trait EventHandler: Send + Sync {
    /// Handle one event. Must not block.
    fn on_event(&self, event: &FederationEvent);
}

/// Delivers federation events to registered handlers and subscribers.
pub struct EventBus {
    sender: broadcast::Sender<FederationEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: Vec::new(),
        }
    }

    /// Register a synchronous handler.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Run handlers, then broadcast. Returns the number of subscribers reached.
    pub fn publish(&self, event: FederationEvent) -> usize {
        for handler in &self.handlers {
            handler.on_event(&event);
        }
        debug!(event = event.kind(), node = ?event.node_id(), "federation event");
        if self.sender.receiver_count() == 0 {
            return 0;
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Drain every event currently queued on a receiver.
pub fn drain(receiver: &mut broadcast::Receiver<FederationEvent>) -> Vec<FederationEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl EventHandler for Recorder {
        fn on_event(&self, event: &FederationEvent) {
            self.seen.lock().push(event.kind());
        }
    }

    fn child(id: &str) -> RegistrationRecord {
        RegistrationRecord::new(id, "", vec![])
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(FederationEvent::ChildRegistered(child("/id-a"))), 0);
    }

    #[test]
    fn test_handlers_run_before_broadcast() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::new(8).with_handler(recorder.clone());
        let mut rx = bus.subscribe();

        let reached = bus.publish(FederationEvent::ChildRegistered(child("/id-a")));
        assert_eq!(reached, 1);
        assert_eq!(*recorder.seen.lock(), vec!["child-registered"]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].node_id().map(String::as_str), Some("/id-a"));
    }

    #[test]
    fn test_drain_returns_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(FederationEvent::ChildRegistered(child("/id-a")));
        bus.publish(FederationEvent::ChildDeregistered(child("/id-a")));
        bus.publish(FederationEvent::DeregisteredFromParent { own: None });
        let kinds: Vec<_> = drain(&mut rx).iter().map(FederationEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "child-registered",
                "child-deregistered",
                "deregistered-from-parent"
            ]
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_counts() {
        let bus = EventBus::new(0).with_handler(Arc::new(Recorder::default()));
        assert_eq!(bus.handler_count(), 1);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
