use thiserror::Error;

use crate::ids::{EntryId, RequestId};
use crate::models::{EntryStatus, RequestStatus};
use crate::store::Precondition;

/// Failures raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("precondition failed: {0}")]
  PreconditionFailed(Precondition),

  #[error("transaction lost a serialization race")]
  Serialization,

  #[error("document codec error: {0}")]
  Codec(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum StandError {
  #[error("agent already holds a place at the stand")]
  AlreadyQueued,

  #[error("queue entry {0} not found")]
  NotFound(EntryId),

  #[error("no queue entry held by this agent")]
  NoEntryForAgent,

  #[error("delivery request {0} not found")]
  NoRequest(RequestId),

  #[error("delivery request {0} was already processed ({1})")]
  AlreadyProcessed(RequestId, RequestStatus),

  #[error("no agent is waiting at the stand")]
  QueueEmpty,

  #[error("concurrent update, retry with fresh state")]
  Conflict,

  #[error("delivery request {0} is not assigned to this agent")]
  NotYours(RequestId),

  #[error("operation not allowed while {0}")]
  InvalidState(String),

  #[error("cannot move from {from} to {to}")]
  InvalidTransition { from: String, to: String },

  #[error("invalid input: {0}")]
  Validation(String),

  #[error(transparent)]
  Store(StoreError),
}

impl StandError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, StandError::Conflict)
  }

  pub fn kind(&self) -> &'static str {
    match self {
      StandError::AlreadyQueued => "already_queued",
      StandError::NotFound(_) | StandError::NoEntryForAgent => "not_found",
      StandError::NoRequest(_) => "no_request",
      StandError::AlreadyProcessed(..) => "already_processed",
      StandError::QueueEmpty => "queue_empty",
      StandError::Conflict => "conflict",
      StandError::NotYours(_) => "not_yours",
      StandError::InvalidState(_) => "invalid_state",
      StandError::InvalidTransition { .. } => "invalid_transition",
      StandError::Validation(_) => "validation",
      StandError::Store(_) => "store",
    }
  }

  pub(crate) fn entry_transition(from: EntryStatus, to: EntryStatus) -> Self {
    StandError::InvalidTransition { from: from.to_string(), to: to.to_string() }
  }

  pub(crate) fn request_transition(from: RequestStatus, to: RequestStatus) -> Self {
    StandError::InvalidTransition { from: from.to_string(), to: to.to_string() }
  }
}

/// Any optimistic failure from the store is a retryable conflict; the
/// caller decides whether it means something more specific.
impl From<StoreError> for StandError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::PreconditionFailed(_) | StoreError::Serialization => StandError::Conflict,
      other => StandError::Store(other),
    }
  }
}

pub type StandResult<T> = Result<T, StandError>;
