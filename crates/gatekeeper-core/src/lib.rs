//! gatekeeper-core: recognition and access-decision engine.
//!
//! Holds the enrolled identities, matches probe embeddings against them
//! with a majority vote over reference photos, and folds per-frame match
//! results into the access status state machine.

pub mod encoder;
pub mod enrollment;
pub mod matcher;
pub mod status;
pub mod types;

pub use encoder::{EncoderError, FaceEncoder};
pub use enrollment::{EmbeddingStore, EnrollmentError};
pub use matcher::{MajorityVoteMatcher, Matcher, MatchingError, DEFAULT_TOLERANCE};
pub use status::{AccessStateMachine, AccessStatus, FrameOutcome, StatusKind, Transition};
pub use types::{BoundingBox, Embedding, Identity, MatchResult, Probe};
