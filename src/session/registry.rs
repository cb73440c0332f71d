//! Router-acknowledged subscriptions and registrations of the live session.

use std::collections::HashMap;

use super::handler::{Event, EventLane, Invocation, InvocationLane};
use crate::protocol::Id;

/// Local id of one subscription listener
pub type ListenerId = u64;

#[derive(Debug)]
struct SubscriptionEntry {
    topic: String,
    listeners: Vec<(ListenerId, EventLane)>,
    /// UNSUBSCRIBE sent, waiting for the router
    unsubscribing: bool,
}

/// Subscription id → topic and listener lanes.
///
/// A router hands out the same subscription id for repeated subscribes to one
/// topic, so an entry can hold several listeners.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<Id, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn add_listener(&mut self, subscription: Id, topic: &str, listener: ListenerId, lane: EventLane) {
        self.entries
            .entry(subscription)
            .or_insert_with(|| SubscriptionEntry {
                topic: topic.to_string(),
                listeners: Vec::new(),
                unsubscribing: false,
            })
            .listeners
            .push((listener, lane));
    }

    pub(crate) fn topic(&self, subscription: Id) -> Option<&str> {
        self.entries.get(&subscription).map(|e| e.topic.as_str())
    }

    pub(crate) fn has_listener(&self, subscription: Id, listener: ListenerId) -> bool {
        self.entries
            .get(&subscription)
            .is_some_and(|e| e.listeners.iter().any(|(id, _)| *id == listener))
    }

    /// Number of listeners under `subscription`
    pub(crate) fn listeners(&self, subscription: Id) -> usize {
        self.entries.get(&subscription).map_or(0, |e| e.listeners.len())
    }

    /// True while an UNSUBSCRIBE for `subscription` is in flight
    pub(crate) fn is_unsubscribing(&self, subscription: Id) -> bool {
        self.entries.get(&subscription).is_some_and(|e| e.unsubscribing)
    }

    pub(crate) fn set_unsubscribing(&mut self, subscription: Id, unsubscribing: bool) {
        if let Some(entry) = self.entries.get_mut(&subscription) {
            entry.unsubscribing = unsubscribing;
        }
    }

    /// Drop one listener, keeping the subscription
    pub(crate) fn remove_listener(&mut self, subscription: Id, listener: ListenerId) -> bool {
        let Some(entry) = self.entries.get_mut(&subscription) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(id, _)| *id != listener);
        entry.listeners.len() != before
    }

    /// Drop a subscription and all its listeners
    pub(crate) fn remove(&mut self, subscription: Id) -> bool {
        self.entries.remove(&subscription).is_some()
    }

    /// Hand `event` to every listener of its subscription; false if unknown
    pub(crate) fn dispatch(&self, event: &Event) -> bool {
        let Some(entry) = self.entries.get(&event.subscription) else {
            return false;
        };
        for (_, lane) in &entry.listeners {
            lane.deliver(event.clone());
        }
        true
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct RegistrationEntry {
    procedure: String,
    lane: InvocationLane,
}

/// Registration id → procedure and invocation lane.
#[derive(Debug, Default)]
pub(crate) struct RegistrationRegistry {
    entries: HashMap<Id, RegistrationEntry>,
}

impl RegistrationRegistry {
    pub(crate) fn insert(&mut self, registration: Id, procedure: &str, lane: InvocationLane) {
        self.entries.insert(
            registration,
            RegistrationEntry {
                procedure: procedure.to_string(),
                lane,
            },
        );
    }

    pub(crate) fn procedure(&self, registration: Id) -> Option<&str> {
        self.entries.get(&registration).map(|e| e.procedure.as_str())
    }

    pub(crate) fn contains(&self, registration: Id) -> bool {
        self.entries.contains_key(&registration)
    }

    /// Hand `invocation` to its lane; false if the registration is unknown
    pub(crate) fn dispatch(&self, invocation: Invocation) -> bool {
        match self.entries.get(&invocation.registration) {
            Some(entry) => entry.lane.deliver(invocation),
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, registration: Id) -> bool {
        self.entries.remove(&registration).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::handler::{event_handler, invocation_handler, YieldSink};
    use super::*;
    use crate::protocol::{Dict, Payload};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn counting_lane(tx: mpsc::UnboundedSender<(u64, Id)>, tag: u64) -> EventLane {
        EventLane::spawn(
            "com.example.t",
            event_handler(move |e: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((tag, e.publication));
                    Ok(())
                }
            }),
        )
    }

    fn event(subscription: Id, publication: Id) -> Event {
        Event {
            subscription,
            publication,
            topic: "com.example.t".to_string(),
            details: Dict::new(),
            payload: Payload::new(),
        }
    }

    #[tokio::test]
    async fn test_shared_subscription_listeners() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::default();
        registry.add_listener(5, "com.example.t", 1, counting_lane(tx.clone(), 1));
        registry.add_listener(5, "com.example.t", 2, counting_lane(tx, 2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.listeners(5), 2);

        assert!(registry.dispatch(&event(5, 10)));
        let mut tags = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);

        assert!(registry.remove_listener(5, 1));
        assert!(!registry.has_listener(5, 1));
        assert_eq!(registry.listeners(5), 1);
        assert!(!registry.dispatch(&event(6, 11)));

        assert!(!registry.is_unsubscribing(5));
        registry.set_unsubscribing(5, true);
        assert!(registry.is_unsubscribing(5));
        registry.set_unsubscribing(5, false);
        assert!(!registry.is_unsubscribing(5));

        registry.clear();
        assert_eq!(registry.topic(5), None);
    }

    #[tokio::test]
    async fn test_registration_dispatch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: YieldSink = Arc::new(move |request, outcome| {
            let _ = tx.send((request, outcome));
        });
        let mut registry = RegistrationRegistry::default();
        registry.insert(
            9,
            "com.example.echo",
            InvocationLane::spawn(
                invocation_handler(|inv: Invocation| async move { Ok(inv.payload) }),
                1,
                sink,
            ),
        );
        assert_eq!(registry.procedure(9), Some("com.example.echo"));

        let invocation = Invocation {
            registration: 9,
            request: 3,
            procedure: "com.example.echo".to_string(),
            details: Dict::new(),
            payload: Payload::with_args([1, 2]),
        };
        assert!(registry.dispatch(invocation.clone()));
        let (request, outcome) = rx.recv().await.unwrap();
        assert_eq!(request, 3);
        assert_eq!(outcome.unwrap(), Payload::with_args([1, 2]));

        assert!(registry.remove(9));
        assert!(!registry.dispatch(invocation));
    }
}
