use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::error::StoreError;
use crate::ids::{EntryId, RequestId};
use crate::models::{DeliveryRequest, HistoryRecord, QueueEntry};
use crate::store::{Batch, CHANGE_FEED_CAPACITY, EntryQuery, Precondition, RequestFilter, Store, StoreResult, Write};

#[derive(Default)]
struct Tables {
  entries: HashMap<EntryId, QueueEntry>,
  requests: HashMap<RequestId, DeliveryRequest>,
  history: Vec<HistoryRecord>,
}

impl Tables {
  fn holds(&self, precondition: &Precondition) -> bool {
    match precondition {
      Precondition::EntryState { id, status, position } => {
        self.entries.get(id).is_some_and(|e| e.status == *status && e.position == *position)
      }
      Precondition::RequestStatus { id, expected } => {
        self.requests.get(id).is_some_and(|r| r.status == *expected)
      }
      Precondition::AgentNotQueued { agent_id } => {
        !self.entries.values().any(|e| e.agent_id == *agent_id && e.status.is_live())
      }
      Precondition::LiveCount { expected } => {
        self.entries.values().filter(|e| e.status.is_live()).count() == *expected
      }
    }
  }

  fn apply(&mut self, write: Write) {
    match write {
      Write::PutEntry(entry) => {
        self.entries.insert(entry.id, entry);
      }
      Write::DeleteEntry(id) => {
        self.entries.remove(&id);
      }
      Write::PutRequest(request) => {
        self.requests.insert(request.id, request);
      }
      Write::AppendHistory(record) => self.history.push(record),
    }
  }
}

/// In-process store. A commit holds the table write lock for its whole
/// check-and-apply, so batches are serializable.
pub struct MemoryStore {
  tables: RwLock<Tables>,
  feed: broadcast::Sender<Write>,
}

impl MemoryStore {
  pub fn new() -> Self {
    let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    Self { tables: RwLock::new(Tables::default()), feed }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl Store for MemoryStore {
  async fn entry(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
    Ok(self.tables.read().await.entries.get(&id).cloned())
  }

  async fn entries(&self, query: EntryQuery) -> StoreResult<Vec<QueueEntry>> {
    let tables = self.tables.read().await;
    let mut found: Vec<QueueEntry> = tables.entries.values().filter(|e| query.matches(e)).cloned().collect();
    found.sort_by_key(|e| (e.position, e.joined_at));
    if let Some(limit) = query.limit {
      found.truncate(limit);
    }
    Ok(found)
  }

  async fn request(&self, id: RequestId) -> StoreResult<Option<DeliveryRequest>> {
    Ok(self.tables.read().await.requests.get(&id).cloned())
  }

  async fn requests(&self, filter: RequestFilter) -> StoreResult<Vec<DeliveryRequest>> {
    let tables = self.tables.read().await;
    let mut found: Vec<DeliveryRequest> = tables.requests.values().filter(|r| filter.matches(r)).cloned().collect();
    found.sort_by_key(|r| (r.created_at, r.id));
    Ok(found)
  }

  async fn history(&self, request_id: RequestId) -> StoreResult<Vec<HistoryRecord>> {
    let tables = self.tables.read().await;
    Ok(tables.history.iter().filter(|h| h.request_id == request_id).cloned().collect())
  }

  async fn commit(&self, batch: Batch) -> StoreResult<()> {
    let mut tables = self.tables.write().await;
    if let Some(failed) = batch.preconditions.iter().find(|p| !tables.holds(p)) {
      debug!("Batch rejected: {}", failed);
      return Err(StoreError::PreconditionFailed(failed.clone()));
    }
    for write in batch.writes {
      tables.apply(write.clone());
      // Sent under the lock so every subscriber sees commit order.
      let _ = self.feed.send(write);
    }
    Ok(())
  }

  fn changes(&self) -> broadcast::Receiver<Write> {
    self.feed.subscribe()
  }
}
