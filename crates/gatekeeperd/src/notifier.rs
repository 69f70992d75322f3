//! Visitor notifications: throttled push alerts on unmatched faces.
//!
//! Sends are spawned onto the runtime so a slow or failing gateway never
//! holds up the transition router, and are attempted at most once.

use crate::config::NotifyConfig;
use gatekeeper_core::{StatusKind, Transition};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway rejected notification: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Payload accepted by the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "fcm_token")]
    pub token: String,
    pub title: String,
    pub body: String,
}

/// External push-notification service.
pub trait PushGateway: Send + Sync + 'static {
    fn send(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotificationError>> + Send;
}

/// Gateway reached over HTTP at `{api_url}/send_notification/`.
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushGateway {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/send_notification/", api_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl PushGateway for HttpPushGateway {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(status = status.as_u16(), response = %body, "gateway accepted notification");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_sent_at: Option<Instant>,
}

/// Decides when a no-match transition becomes an outbound notification.
pub struct NotificationDispatcher<G> {
    gateway: Arc<G>,
    template: Notification,
    cooldown: Duration,
    notify_on_empty_frames: bool,
    throttle: Arc<Mutex<ThrottleState>>,
}

impl<G: PushGateway> NotificationDispatcher<G> {
    pub fn new(gateway: G, config: &NotifyConfig) -> Self {
        Self {
            gateway: Arc::new(gateway),
            template: Notification {
                token: config.device_token.clone(),
                title: config.title.clone(),
                body: config.body.clone(),
            },
            cooldown: config.cooldown,
            notify_on_empty_frames: config.notify_on_empty_frames,
            throttle: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    /// Handle one transition. Returns the spawned send when a notification
    /// was dispatched, `None` when the transition was ignored or throttled.
    ///
    /// The cooldown slot is claimed before the send starts so concurrent
    /// no-match cycles cannot double-send; a failed send gives the slot back.
    pub fn on_transition(&self, transition: &Transition, now: Instant) -> Option<JoinHandle<()>> {
        if transition.status.kind != StatusKind::NoMatch {
            return None;
        }
        if transition.unmatched == 0 && !self.notify_on_empty_frames {
            return None;
        }

        let previous = {
            let mut throttle = self.throttle.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = throttle.last_sent_at {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.cooldown {
                    tracing::debug!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "notification suppressed by cooldown"
                    );
                    return None;
                }
            }
            throttle.last_sent_at.replace(now)
        };

        let gateway = Arc::clone(&self.gateway);
        let throttle = Arc::clone(&self.throttle);
        let notification = self.template.clone();
        let sequence = transition.status.sequence;
        let visitors = transition.unmatched;

        Some(tokio::spawn(async move {
            match gateway.send(&notification).await {
                Ok(()) => {
                    tracing::info!(sequence, visitors, "visitor notification sent");
                }
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "visitor notification failed");
                    let mut t = throttle.lock().unwrap_or_else(|p| p.into_inner());
                    if t.last_sent_at == Some(now) {
                        t.last_sent_at = previous;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::{AccessStateMachine, FrameOutcome, MatchResult};

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    impl PushGateway for Arc<RecordingGateway> {
        async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(NotificationError::Rejected {
                    status: 500,
                    body: "down".into(),
                });
            }
            Ok(())
        }
    }

    fn config(cooldown_secs: u64) -> NotifyConfig {
        NotifyConfig {
            api_url: "http://gateway.invalid".into(),
            device_token: "device-123".into(),
            cooldown: Duration::from_secs(cooldown_secs),
            timeout: Duration::from_secs(1),
            notify_on_empty_frames: false,
            title: "No user Match".into(),
            body: "unregistered people".into(),
        }
    }

    fn visitor(machine: &mut AccessStateMachine) -> Transition {
        machine.apply(&FrameOutcome::new(vec![MatchResult::Unmatched]), Instant::now())
    }

    async fn settle(handle: Option<JoinHandle<()>>) -> bool {
        match handle {
            Some(h) => {
                h.await.unwrap();
                true
            }
            None => false,
        }
    }

    #[tokio::test]
    async fn test_two_no_match_within_cooldown_send_once() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = NotificationDispatcher::new(gateway.clone(), &config(8));
        let mut machine = AccessStateMachine::new();
        let t0 = Instant::now();

        assert!(settle(dispatcher.on_transition(&visitor(&mut machine), t0)).await);
        assert!(!settle(dispatcher.on_transition(&visitor(&mut machine), t0 + Duration::from_secs(3))).await);

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "No user Match");
        assert_eq!(sent[0].body, "unregistered people");
        assert_eq!(sent[0].token, "device-123");
    }

    #[tokio::test]
    async fn test_spaced_no_match_each_send() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = NotificationDispatcher::new(gateway.clone(), &config(8));
        let mut machine = AccessStateMachine::new();
        let t0 = Instant::now();

        for i in 0..3 {
            let at = t0 + Duration::from_secs(8 * i);
            assert!(settle(dispatcher.on_transition(&visitor(&mut machine), at)).await);
        }
        assert_eq!(gateway.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_send_releases_cooldown() {
        let gateway = Arc::new(RecordingGateway {
            fail: true,
            ..Default::default()
        });
        let dispatcher = NotificationDispatcher::new(gateway.clone(), &config(8));
        let mut machine = AccessStateMachine::new();
        let t0 = Instant::now();

        assert!(settle(dispatcher.on_transition(&visitor(&mut machine), t0)).await);
        // No automatic retry happened; the next no-match may try again.
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
        assert!(settle(dispatcher.on_transition(&visitor(&mut machine), t0 + Duration::from_secs(1))).await);
        assert_eq!(gateway.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_only_no_match_with_visitors_notifies() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = NotificationDispatcher::new(gateway.clone(), &config(0));
        let mut machine = AccessStateMachine::new();
        let now = Instant::now();

        let granted = machine.apply(
            &FrameOutcome::new(vec![MatchResult::Matched {
                identity: "alice".into(),
                distance: 0.1,
            }]),
            now,
        );
        assert!(dispatcher.on_transition(&granted, now).is_none());

        let empty = machine.apply(&FrameOutcome::default(), now);
        assert_eq!(empty.status.kind, StatusKind::NoMatch);
        assert!(dispatcher.on_transition(&empty, now).is_none());

        assert!(gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_frames_notify_when_enabled() {
        let gateway = Arc::new(RecordingGateway::default());
        let mut cfg = config(8);
        cfg.notify_on_empty_frames = true;
        let dispatcher = NotificationDispatcher::new(gateway.clone(), &cfg);
        let mut machine = AccessStateMachine::new();

        let empty = machine.apply(&FrameOutcome::default(), Instant::now());
        assert!(settle(dispatcher.on_transition(&empty, Instant::now())).await);
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_payload_shape() {
        let n = Notification {
            token: "tok".into(),
            title: "No user Match".into(),
            body: "unregistered people".into(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "fcm_token": "tok",
                "title": "No user Match",
                "body": "unregistered people",
            })
        );
    }

    #[test]
    fn test_http_gateway_endpoint() {
        let gw = HttpPushGateway::new("http://api.local:8000/", Duration::from_secs(2)).unwrap();
        assert_eq!(gw.endpoint(), "http://api.local:8000/send_notification/");
    }
}
