use gatekeeper_core::{
    AccessStateMachine, AccessStatus, EmbeddingStore, FaceEncoder, FrameOutcome, MatchResult,
    Matcher, Probe, StatusKind, Transition,
};
use gatekeeper_hw::FrameSource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture source unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("capture failed {attempts} times in a row, last error: {last}")]
    CaptureExhausted { attempts: u32, last: String },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Retry policy for the capture loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Consecutive transient capture failures tolerated before giving up.
    pub max_capture_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_capture_failures: 30,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Doubling delay between retries, capped at `max`.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Matching + state machine for one frame's probes.
pub struct Pipeline<M> {
    store: Arc<EmbeddingStore>,
    matcher: M,
    machine: AccessStateMachine,
}

impl<M: Matcher> Pipeline<M> {
    pub fn new(store: Arc<EmbeddingStore>, matcher: M, machine: AccessStateMachine) -> Self {
        Self {
            store,
            matcher,
            machine,
        }
    }

    /// Match every probe and fold the frame into the access status.
    /// A probe the matcher rejects counts as unmatched.
    pub fn process(&mut self, probes: &[Probe], now: Instant) -> Transition {
        let results = probes
            .iter()
            .map(|probe| {
                self.matcher
                    .match_probe(&probe.embedding, &self.store)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "discarding malformed probe");
                        MatchResult::Unmatched
                    })
            })
            .collect();

        self.machine.apply(&FrameOutcome::new(results), now)
    }

    pub fn current(&self) -> &AccessStatus {
        self.machine.current()
    }

    /// Whether empty cycles can move the status on their own (idle reset).
    pub fn tracks_idle(&self) -> bool {
        self.machine.idle_reset().is_some()
    }
}

/// Drive the pipeline from `source` until the transition channel closes
/// or capture fails for good.
pub fn run_capture_loop<S, E, M>(
    mut source: S,
    mut encoder: E,
    mut pipeline: Pipeline<M>,
    transitions: mpsc::UnboundedSender<Transition>,
    settings: &EngineSettings,
) -> Result<(), EngineError>
where
    S: FrameSource,
    E: FaceEncoder,
    M: Matcher,
{
    let mut capture_failures = 0u32;
    let mut capture_backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
    let mut encoder_backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);

    tracing::info!("capture loop started");
    while !transitions.is_closed() {
        let frame = match source.next_frame() {
            Ok(frame) => {
                capture_failures = 0;
                capture_backoff.reset();
                frame
            }
            Err(e) if e.is_permanent() => {
                return Err(EngineError::CaptureUnavailable(e.to_string()));
            }
            Err(e) => {
                capture_failures += 1;
                if capture_failures > settings.max_capture_failures {
                    return Err(EngineError::CaptureExhausted {
                        attempts: capture_failures,
                        last: e.to_string(),
                    });
                }
                let delay = capture_backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    failures = capture_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "frame capture failed"
                );
                std::thread::sleep(delay);
                continue;
            }
        };

        // A dark frame holds no faces. It only reaches the state machine
        // when the idle clock needs it.
        let probes = if frame.is_dark {
            if !pipeline.tracks_idle() {
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }
            Vec::new()
        } else {
            match encoder.encode(&frame.data, frame.width, frame.height) {
                Ok(probes) => {
                    encoder_backoff.reset();
                    probes
                }
                Err(e) => {
                    let delay = encoder_backoff.next_delay();
                    tracing::warn!(error = %e, seq = frame.sequence, "face encoding failed; frame skipped");
                    std::thread::sleep(delay);
                    continue;
                }
            }
        };

        let transition = pipeline.process(&probes, Instant::now());
        if transition.changed() {
            match &transition.status.kind {
                StatusKind::Granted(name) => {
                    tracing::info!(identity = %name, sequence = transition.status.sequence, "access granted")
                }
                kind => tracing::info!(
                    status = ?kind.code(),
                    faces = transition.faces,
                    sequence = transition.status.sequence,
                    "access status changed"
                ),
            }
        }

        if transitions.send(transition).is_err() {
            break;
        }
    }

    tracing::info!("transition channel closed; capture loop exiting");
    Ok(())
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// The returned receiver resolves when the loop ends: `Ok(())` on a clean
/// shutdown, the fatal error otherwise.
pub fn spawn_engine<S, E, M>(
    source: S,
    encoder: E,
    pipeline: Pipeline<M>,
    transitions: mpsc::UnboundedSender<Transition>,
    settings: EngineSettings,
) -> Result<oneshot::Receiver<Result<(), EngineError>>, EngineError>
where
    S: FrameSource + 'static,
    E: FaceEncoder + 'static,
    M: Matcher + 'static,
{
    let (exit_tx, exit_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("gatekeeper-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let result = run_capture_loop(source, encoder, pipeline, transitions, &settings);
            if let Err(e) = &result {
                tracing::error!(error = %e, "engine stopped");
            }
            let _ = exit_tx.send(result);
        })
        .map_err(EngineError::Spawn)?;

    Ok(exit_rx)
}
