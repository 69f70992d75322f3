//! Broadcast hub: fans access status transitions out to connected viewers.
//!
//! Each subscriber owns a bounded channel. A subscriber whose channel is
//! closed or full is dropped on the next publish; the others are unaffected.
//! The latest snapshot is stored next to the subscriber map under one lock,
//! so a new subscriber always starts from the status in effect at the moment
//! it registered and sees every later transition.

use gatekeeper_core::{AccessStatus, Transition};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-subscriber queue depth before the subscriber is considered stalled.
pub const SUBSCRIBER_BUFFER: usize = 32;

pub type SubscriberId = Uuid;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("subscriber lagging ({0} messages queued)")]
    Lagging(usize),
}

struct HubState {
    current: AccessStatus,
    subscribers: HashMap<SubscriberId, mpsc::Sender<AccessStatus>>,
}

pub struct BroadcastHub {
    state: Mutex<HubState>,
}

impl BroadcastHub {
    pub fn new(initial: AccessStatus) -> Self {
        Self {
            state: Mutex::new(HubState {
                current: initial,
                subscribers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Nothing inside the lock can leave the state half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber. The current snapshot is already queued on
    /// the returned receiver.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<AccessStatus>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut state = self.lock();
        // Fresh channel: capacity is available.
        let _ = tx.try_send(state.current.clone());
        state.subscribers.insert(id, tx);
        let count = state.subscribers.len();
        drop(state);

        tracing::info!(subscriber = %id, subscribers = count, "subscriber connected");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &SubscriberId) {
        let mut state = self.lock();
        if state.subscribers.remove(id).is_some() {
            tracing::info!(subscriber = %id, subscribers = state.subscribers.len(), "subscriber disconnected");
        }
    }

    /// Record the transition as the current snapshot and deliver it to
    /// every subscriber. Never blocks on a slow subscriber.
    pub fn publish(&self, transition: &Transition) {
        let mut state = self.lock();
        state.current = transition.status.clone();

        let mut dropped = Vec::new();
        for (id, tx) in &state.subscribers {
            if let Err(e) = deliver(tx, &transition.status) {
                tracing::warn!(subscriber = %id, error = %e, "dropping subscriber");
                dropped.push(*id);
            }
        }
        for id in &dropped {
            state.subscribers.remove(id);
        }

        tracing::trace!(
            sequence = transition.status.sequence,
            subscribers = state.subscribers.len(),
            dropped = dropped.len(),
            "transition published"
        );
    }

    /// Latest published status.
    pub fn current(&self) -> AccessStatus {
        self.lock().current.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

fn deliver(tx: &mpsc::Sender<AccessStatus>, status: &AccessStatus) -> Result<(), BroadcastError> {
    tx.try_send(status.clone()).map_err(|e| match e {
        mpsc::error::TrySendError::Closed(_) => BroadcastError::Disconnected,
        mpsc::error::TrySendError::Full(_) => BroadcastError::Lagging(SUBSCRIBER_BUFFER),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::{AccessStateMachine, FrameOutcome, MatchResult, StatusKind};
    use std::time::Instant;

    fn granted(machine: &mut AccessStateMachine, name: &str) -> Transition {
        machine.apply(
            &FrameOutcome::new(vec![MatchResult::Matched {
                identity: name.into(),
                distance: 0.2,
            }]),
            Instant::now(),
        )
    }

    #[test]
    fn test_subscribe_receives_current_snapshot() {
        let mut machine = AccessStateMachine::new();
        let hub = BroadcastHub::new(machine.current().clone());
        hub.publish(&granted(&mut machine, "alice"));

        let (_, mut rx) = hub.subscribe();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, StatusKind::Granted("alice".into()));
        assert_eq!(first.sequence, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let mut machine = AccessStateMachine::new();
        let hub = BroadcastHub::new(machine.current().clone());
        let (_, mut a) = hub.subscribe();
        let (_, mut b) = hub.subscribe();
        a.try_recv().unwrap();
        b.try_recv().unwrap();

        let t = machine.apply(&FrameOutcome::default(), Instant::now());
        hub.publish(&t);

        assert_eq!(a.try_recv().unwrap().kind, StatusKind::NoMatch);
        assert_eq!(b.try_recv().unwrap().kind, StatusKind::NoMatch);
        assert_eq!(hub.current().sequence, 1);
    }

    #[test]
    fn test_failed_subscriber_is_dropped_others_still_served() {
        let mut machine = AccessStateMachine::new();
        let hub = BroadcastHub::new(machine.current().clone());
        let (_, mut keep) = hub.subscribe();
        let (_, gone) = hub.subscribe();
        let (_, mut also_keep) = hub.subscribe();
        drop(gone);
        keep.try_recv().unwrap();
        also_keep.try_recv().unwrap();

        hub.publish(&granted(&mut machine, "alice"));
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(&granted(&mut machine, "bob"));
        for rx in [&mut keep, &mut also_keep] {
            assert_eq!(rx.try_recv().unwrap().kind, StatusKind::Granted("alice".into()));
            assert_eq!(rx.try_recv().unwrap().kind, StatusKind::Granted("bob".into()));
        }
    }

    #[test]
    fn test_lagging_subscriber_is_dropped() {
        let mut machine = AccessStateMachine::new();
        let hub = BroadcastHub::new(machine.current().clone());
        let (_, _stalled) = hub.subscribe();
        let (_, mut live) = hub.subscribe();

        for _ in 0..SUBSCRIBER_BUFFER {
            let t = machine.apply(&FrameOutcome::default(), Instant::now());
            hub.publish(&t);
            while live.try_recv().is_ok() {}
        }

        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = BroadcastHub::new(AccessStatus::initial());
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(&id);
        hub.unsubscribe(&id);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
