//! Access status state machine.
//!
//! Folds the per-probe match results of one frame into the process-wide
//! access status. The machine is owned by the capture loop, which makes it
//! the single writer; everyone else sees cloned [`AccessStatus`] snapshots.

use crate::types::MatchResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// The decision part of the access status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusKind {
    #[default]
    Pending,
    Granted(String),
    Denied,
    NoMatch,
}

impl StatusKind {
    pub fn code(&self) -> StatusCode {
        match self {
            StatusKind::Pending => StatusCode::Pending,
            StatusKind::Granted(_) => StatusCode::Granted,
            StatusKind::Denied => StatusCode::Denied,
            StatusKind::NoMatch => StatusCode::NoMatch,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            StatusKind::Granted(name) => Some(name),
            _ => None,
        }
    }
}

/// Wire tag for [`StatusKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Pending,
    Granted,
    Denied,
    NoMatch,
}

/// Current access status: decision plus when and in which cycle it was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StatusMessage", try_from = "StatusMessage")]
pub struct AccessStatus {
    pub kind: StatusKind,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl AccessStatus {
    pub fn initial() -> Self {
        Self {
            kind: StatusKind::Pending,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }
}

/// Flat message shape sent to viewers:
/// `{ "status": "granted", "identity": "alice", "timestamp": "...", "sequence": 7 }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl From<AccessStatus> for StatusMessage {
    fn from(s: AccessStatus) -> Self {
        let status = s.kind.code();
        let identity = match s.kind {
            StatusKind::Granted(name) => Some(name),
            _ => None,
        };
        Self {
            status,
            identity,
            timestamp: s.timestamp,
            sequence: s.sequence,
        }
    }
}

impl TryFrom<StatusMessage> for AccessStatus {
    type Error = String;

    fn try_from(m: StatusMessage) -> Result<Self, Self::Error> {
        let kind = match (m.status, m.identity) {
            (StatusCode::Pending, _) => StatusKind::Pending,
            (StatusCode::Granted, Some(name)) => StatusKind::Granted(name),
            (StatusCode::Granted, None) => return Err("granted status without identity".into()),
            (StatusCode::Denied, _) => StatusKind::Denied,
            (StatusCode::NoMatch, _) => StatusKind::NoMatch,
        };
        Ok(Self {
            kind,
            timestamp: m.timestamp,
            sequence: m.sequence,
        })
    }
}

/// Per-probe match results of one frame, in detection order.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub results: Vec<MatchResult>,
}

impl FrameOutcome {
    pub fn new(results: Vec<MatchResult>) -> Self {
        Self { results }
    }

    /// Number of faces detected in the frame.
    pub fn faces(&self) -> usize {
        self.results.len()
    }

    pub fn unmatched(&self) -> usize {
        self.results.iter().filter(|r| !r.is_matched()).count()
    }
}

/// One step of the state machine, handed to every downstream consumer.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: AccessStatus,
    pub previous: StatusKind,
    pub faces: usize,
    pub unmatched: usize,
}

impl Transition {
    /// True when the decision (kind or identity) differs from the previous one.
    pub fn changed(&self) -> bool {
        self.status.kind != self.previous
    }
}

/// Owns the current [`AccessStatus`] and applies per-frame outcomes to it.
#[derive(Debug)]
pub struct AccessStateMachine {
    current: AccessStatus,
    deny_list: HashSet<String>,
    idle_reset: Option<Duration>,
    last_face_at: Option<Instant>,
}

impl Default for AccessStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessStateMachine {
    pub fn new() -> Self {
        Self {
            current: AccessStatus::initial(),
            deny_list: HashSet::new(),
            idle_reset: None,
            last_face_at: None,
        }
    }

    /// Identities that are recognised but must not be let in.
    pub fn with_deny_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny_list = names.into_iter().map(Into::into).collect();
        self
    }

    /// Fall back to `Pending` after `idle` without any detected face.
    /// `None` keeps the last decision for as long as frames stay empty.
    pub fn with_idle_reset(mut self, idle: Option<Duration>) -> Self {
        self.idle_reset = idle;
        self
    }

    pub fn idle_reset(&self) -> Option<Duration> {
        self.idle_reset
    }

    pub fn current(&self) -> &AccessStatus {
        &self.current
    }

    /// Apply one frame's outcome and return the resulting transition.
    ///
    /// The first permitted match in detection order wins when several
    /// identities are in view at once.
    pub fn apply(&mut self, outcome: &FrameOutcome, now: Instant) -> Transition {
        let idle_since = *self.last_face_at.get_or_insert(now);
        if outcome.faces() > 0 {
            self.last_face_at = Some(now);
        }

        let granted = outcome
            .results
            .iter()
            .filter_map(MatchResult::identity)
            .find(|name| !self.deny_list.contains(*name));

        let kind = if let Some(name) = granted {
            StatusKind::Granted(name.to_string())
        } else if outcome.results.iter().any(MatchResult::is_matched) {
            StatusKind::Denied
        } else if outcome.faces() == 0
            && self
                .idle_reset
                .is_some_and(|idle| now.saturating_duration_since(idle_since) >= idle)
        {
            StatusKind::Pending
        } else {
            StatusKind::NoMatch
        };

        // Wall-clock stamps never run backwards across transitions.
        let timestamp = Utc::now().max(self.current.timestamp);
        let next = AccessStatus {
            kind,
            timestamp,
            sequence: self.current.sequence + 1,
        };
        let previous = std::mem::replace(&mut self.current, next).kind;

        Transition {
            status: self.current.clone(),
            previous,
            faces: outcome.faces(),
            unmatched: outcome.unmatched(),
        }
    }
}
