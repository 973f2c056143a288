//! Matches pending delivery requests to the front of the stand.
//!
//! The dispatcher keeps no state. Each attempt takes the position lock,
//! re-reads the request and the head, then commits request and entry together
//! behind two preconditions (request still `pending`, entry still `waiting` at
//! the position read). Two dispatches racing for the same head therefore
//! cannot both win; the loser gets `Conflict`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Policy;
use crate::error::{StandError, StandResult};
use crate::ids::RequestId;
use crate::models::{AssignedAgent, Assignment, EntryStatus, HistoryAction, RequestStatus};
use crate::queue::QueueStore;
use crate::requests::RequestStore;
use crate::retry;
use crate::store::{Batch, Store};

pub struct Dispatcher<S> {
  store: Arc<S>,
  queue: QueueStore<S>,
  requests: RequestStore<S>,
  policy: Policy,
}

impl<S> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      queue: self.queue.clone(),
      requests: self.requests.clone(),
      policy: self.policy.clone(),
    }
  }
}

impl<S: Store> Dispatcher<S> {
  pub fn new(store: Arc<S>, queue: QueueStore<S>, requests: RequestStore<S>, policy: Policy) -> Self {
    Self { store, queue, requests, policy }
  }

  /// One dispatch attempt to the head of the stand. `Conflict` means a
  /// concurrent writer moved the request or the head first; see
  /// [`Dispatcher::assign_with_retry`].
  pub async fn assign(&self, id: RequestId) -> StandResult<Assignment> {
    self.dispatch(id, false).await
  }

  /// `assign`, retried with backoff while it conflicts.
  pub async fn assign_with_retry(&self, id: RequestId) -> StandResult<Assignment> {
    retry::on_conflict(&self.policy, || self.assign(id)).await
  }

  /// Dispatch after a rejection: the first waiting agent who has not already
  /// turned this request down, retried while it conflicts.
  pub async fn redispatch(&self, id: RequestId) -> StandResult<Assignment> {
    retry::on_conflict(&self.policy, || self.dispatch(id, true)).await
  }

  async fn dispatch(&self, id: RequestId, skip_rejecters: bool) -> StandResult<Assignment> {
    let _positions = self.queue.lock_positions().await;
    let request = self.requests.get(id).await?;
    if request.status != RequestStatus::Pending {
      return Err(StandError::AlreadyProcessed(id, request.status));
    }
    let head = if skip_rejecters {
      self.queue.head_excluding(&request.rejected_by).await?
    } else {
      self.queue.head().await?
    };
    let head = head.ok_or(StandError::QueueEmpty)?;

    let now = Utc::now();
    let mut batch = Batch::new();
    let entry = self.queue.stage_status(&mut batch, &head, EntryStatus::Active, now)?;
    self.requests.stage_status(&mut batch, &request, RequestStatus::Assigned, now, |r| {
      r.agent = Some(AssignedAgent {
        agent_id: entry.agent_id.clone(),
        name: entry.agent_name.clone(),
        phone: entry.agent_phone.clone(),
      });
    });
    self.requests.stage_history(&mut batch, id, &entry.agent_id, HistoryAction::AutoAssigned, now, None);

    if let Err(e) = self.store.commit(batch).await {
      warn!("Dispatch of request {} to agent {} lost a race: {}", id, entry.agent_id, e);
      return Err(e.into());
    }

    info!("Request {} assigned to agent {} (position {})", id, entry.agent_id, entry.position);
    Ok(Assignment {
      request_id: id,
      entry_id: entry.id,
      agent_id: entry.agent_id,
      agent_name: entry.agent_name,
      position: entry.position,
    })
  }
}
