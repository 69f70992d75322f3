//! Fans transitions from the engine thread out to the async consumers.

use crate::history::{HistoryLog, HistoryRecord};
use crate::hub::BroadcastHub;
use crate::notifier::{NotificationDispatcher, PushGateway};
use gatekeeper_core::Transition;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub struct TransitionRouter<G> {
    hub: Arc<BroadcastHub>,
    dispatcher: Option<NotificationDispatcher<G>>,
    history: Option<HistoryLog>,
}

impl<G: PushGateway> TransitionRouter<G> {
    pub fn new(
        hub: Arc<BroadcastHub>,
        dispatcher: Option<NotificationDispatcher<G>>,
        history: Option<HistoryLog>,
    ) -> Self {
        Self {
            hub,
            dispatcher,
            history,
        }
    }

    /// Consume transitions until the engine drops its sender.
    pub async fn run(self, mut transitions: mpsc::UnboundedReceiver<Transition>) {
        while let Some(transition) = transitions.recv().await {
            self.route(&transition);
        }
        tracing::info!("transition stream ended");
    }

    /// Deliver one transition. Never waits on network or disk.
    pub fn route(&self, transition: &Transition) {
        self.hub.publish(transition);

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.on_transition(transition, Instant::now());
        }

        if transition.changed() {
            if let Some(history) = &self.history {
                let history = history.clone();
                let record = HistoryRecord::from_transition(transition);
                tokio::spawn(async move {
                    if let Err(e) = history.record(record).await {
                        tracing::warn!(error = %e, "failed to record access history");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyConfig;
    use crate::notifier::{Notification, NotificationError};
    use gatekeeper_core::{AccessStateMachine, AccessStatus, FrameOutcome, MatchResult, StatusKind};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    impl PushGateway for Arc<Recorder> {
        async fn send(&self, n: &Notification) -> Result<(), NotificationError> {
            self.0.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    fn notify_config() -> NotifyConfig {
        NotifyConfig {
            api_url: "http://gateway.invalid".into(),
            device_token: "tok".into(),
            cooldown: Duration::from_secs(8),
            timeout: Duration::from_secs(1),
            notify_on_empty_frames: false,
            title: "No user Match".into(),
            body: "unregistered people".into(),
        }
    }

    #[tokio::test]
    async fn test_stranger_reaches_every_consumer() {
        let hub = Arc::new(BroadcastHub::new(AccessStatus::initial()));
        let gateway = Arc::new(Recorder::default());
        let history = HistoryLog::open_in_memory().await.unwrap();
        let router = TransitionRouter::new(
            hub.clone(),
            Some(NotificationDispatcher::new(gateway.clone(), &notify_config())),
            Some(history.clone()),
        );
        let (_, mut viewer) = hub.subscribe();
        viewer.recv().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(router.run(rx));

        let mut machine = AccessStateMachine::new();
        for _ in 0..2 {
            let t = machine.apply(&FrameOutcome::new(vec![MatchResult::Unmatched]), Instant::now());
            tx.send(t).unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(viewer.recv().await.unwrap().sequence, 1);
        assert_eq!(viewer.recv().await.unwrap().sequence, 2);
        assert_eq!(hub.current().kind, StatusKind::NoMatch);

        // Spawned side effects finish shortly after routing.
        for _ in 0..50 {
            let sent = gateway.0.lock().unwrap().len();
            let recorded = history.recent(10).await.unwrap().len();
            if sent == 1 && recorded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = gateway.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "No user Match");

        // Only the change from pending is recorded.
        let rows = history.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "unknown");
    }

    #[tokio::test]
    async fn test_granted_without_optional_sinks() {
        let hub = Arc::new(BroadcastHub::new(AccessStatus::initial()));
        let router: TransitionRouter<Arc<Recorder>> = TransitionRouter::new(hub.clone(), None, None);

        let mut machine = AccessStateMachine::new();
        let t = machine.apply(
            &FrameOutcome::new(vec![MatchResult::Matched {
                identity: "alice".into(),
                distance: 0.3,
            }]),
            Instant::now(),
        );
        router.route(&t);
        assert_eq!(hub.current().kind, StatusKind::Granted("alice".into()));
    }
}
