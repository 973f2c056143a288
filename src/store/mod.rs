//! Document-store contract the stand engine runs against.
//!
//! Reads are plain snapshots. Every mutation goes through [`Store::commit`],
//! which applies a [`Batch`] all-or-nothing after checking its
//! preconditions against the state at commit time.

use std::fmt;
use std::future::Future;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::ids::{AgentId, ClientId, EntryId, RequestId};
use crate::models::{DeliveryRequest, EntryStatus, HistoryRecord, QueueEntry, RequestStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of the change feed; slow subscribers see `Lagged` and resync.
pub const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "precondition", rename_all = "snake_case")]
pub enum Precondition {
  /// The entry still has this status at this position.
  EntryState { id: EntryId, status: EntryStatus, position: u32 },
  RequestStatus { id: RequestId, expected: RequestStatus },
  AgentNotQueued { agent_id: AgentId },
  /// Number of waiting + active entries. Any change to the position space
  /// changes this count, so it fences joins against compactions.
  LiveCount { expected: usize },
}

impl fmt::Display for Precondition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Precondition::EntryState { id, status, position } => {
        write!(f, "entry {} is {} at position {}", id, status, position)
      }
      Precondition::RequestStatus { id, expected } => write!(f, "request {} is {}", id, expected),
      Precondition::AgentNotQueued { agent_id } => write!(f, "agent {} holds no live entry", agent_id),
      Precondition::LiveCount { expected } => write!(f, "{} live entries", expected),
    }
  }
}

/// A single document mutation. Committed writes are also what the change
/// feed carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", content = "document", rename_all = "snake_case")]
pub enum Write {
  PutEntry(QueueEntry),
  DeleteEntry(EntryId),
  PutRequest(DeliveryRequest),
  AppendHistory(HistoryRecord),
}

impl Write {
  pub fn kind(&self) -> &'static str {
    match self {
      Write::PutEntry(_) => "put_entry",
      Write::DeleteEntry(_) => "delete_entry",
      Write::PutRequest(_) => "put_request",
      Write::AppendHistory(_) => "append_history",
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
  pub preconditions: Vec<Precondition>,
  pub writes: Vec<Write>,
}

impl Batch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn require(&mut self, precondition: Precondition) -> &mut Self {
    self.preconditions.push(precondition);
    self
  }

  pub fn write(&mut self, write: Write) -> &mut Self {
    self.writes.push(write);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.writes.is_empty()
  }
}

/// Queue-entry query; results are always ascending by position.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
  pub statuses: Vec<EntryStatus>,
  pub agent_id: Option<AgentId>,
  pub after_position: Option<u32>,
  pub limit: Option<usize>,
}

impl EntryQuery {
  pub fn with_status(statuses: &[EntryStatus]) -> Self {
    Self { statuses: statuses.to_vec(), ..Self::default() }
  }

  pub fn live() -> Self {
    Self::with_status(&EntryStatus::LIVE)
  }

  pub fn agent(mut self, agent_id: &AgentId) -> Self {
    self.agent_id = Some(agent_id.clone());
    self
  }

  pub fn after(mut self, position: u32) -> Self {
    self.after_position = Some(position);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, entry: &QueueEntry) -> bool {
    (self.statuses.is_empty() || self.statuses.contains(&entry.status))
      && self.agent_id.as_ref().is_none_or(|a| *a == entry.agent_id)
      && self.after_position.is_none_or(|p| entry.position > p)
  }
}

/// Request filter shared by listings and live subscriptions. Results are
/// ascending by creation time.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
  pub statuses: Vec<RequestStatus>,
  pub agent_id: Option<AgentId>,
  pub client_id: Option<ClientId>,
}

impl RequestFilter {
  pub fn status(status: RequestStatus) -> Self {
    Self { statuses: vec![status], ..Self::default() }
  }

  pub fn matches(&self, request: &DeliveryRequest) -> bool {
    (self.statuses.is_empty() || self.statuses.contains(&request.status))
      && self.agent_id.as_ref().is_none_or(|a| request.agent_id() == Some(a))
      && self.client_id.as_ref().is_none_or(|c| *c == request.client_id)
  }
}

pub trait Store: Send + Sync + 'static {
  fn entry(&self, id: EntryId) -> impl Future<Output = StoreResult<Option<QueueEntry>>> + Send;

  fn entries(&self, query: EntryQuery) -> impl Future<Output = StoreResult<Vec<QueueEntry>>> + Send;

  fn request(&self, id: RequestId) -> impl Future<Output = StoreResult<Option<DeliveryRequest>>> + Send;

  fn requests(&self, filter: RequestFilter) -> impl Future<Output = StoreResult<Vec<DeliveryRequest>>> + Send;

  fn history(&self, request_id: RequestId) -> impl Future<Output = StoreResult<Vec<HistoryRecord>>> + Send;

  /// Apply every write or none. Fails with `PreconditionFailed` when any
  /// precondition does not hold at commit time.
  fn commit(&self, batch: Batch) -> impl Future<Output = StoreResult<()>> + Send;

  /// Committed writes, in commit order per subscriber.
  fn changes(&self) -> broadcast::Receiver<Write>;
}
