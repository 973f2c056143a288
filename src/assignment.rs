//! What happens to a request once it has an agent.
//!
//! ```text
//! assigned -> accepted -> picked_up -> in_transit -> delivered -> completed
//!     \-> rejected
//! ```
//!
//! Accept and reject move the agent's queue entry in the same batch as the
//! request: accepting takes the agent off the stand, rejecting puts them back
//! to `waiting` where they stood. Both read the entry under the position
//! lock and are retried while they conflict with a concurrent compaction.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::Policy;
use crate::error::{StandError, StandResult};
use crate::ids::{AgentId, RequestId};
use crate::models::{DeliveryRequest, EntryStatus, HistoryAction, QueueEntry, RequestStatus};
use crate::queue::QueueStore;
use crate::requests::RequestStore;
use crate::retry;
use crate::store::{Batch, Store};

pub struct Assignments<S> {
  store: Arc<S>,
  queue: QueueStore<S>,
  requests: RequestStore<S>,
  policy: Policy,
}

impl<S> Clone for Assignments<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      queue: self.queue.clone(),
      requests: self.requests.clone(),
      policy: self.policy.clone(),
    }
  }
}

/// Ownership is checked before state.
fn check_holder(request: &DeliveryRequest, agent_id: &AgentId, expected: RequestStatus) -> StandResult<()> {
  if request.agent_id().is_some_and(|holder| holder != agent_id) {
    return Err(StandError::NotYours(request.id));
  }
  if request.status != expected {
    return Err(StandError::InvalidState(format!("request is {}", request.status)));
  }
  Ok(())
}

impl<S: Store> Assignments<S> {
  pub fn new(store: Arc<S>, queue: QueueStore<S>, requests: RequestStore<S>, policy: Policy) -> Self {
    Self { store, queue, requests, policy }
  }

  async fn active_entry(&self, agent_id: &AgentId) -> StandResult<QueueEntry> {
    let entry = self.queue.live_entry_for(agent_id).await?.ok_or(StandError::NoEntryForAgent)?;
    if entry.status != EntryStatus::Active {
      return Err(StandError::InvalidState(format!("queue entry is {}", entry.status)));
    }
    Ok(entry)
  }

  pub async fn accept(&self, id: RequestId, agent_id: &AgentId) -> StandResult<DeliveryRequest> {
    retry::on_conflict(&self.policy, || self.try_accept(id, agent_id)).await
  }

  async fn try_accept(&self, id: RequestId, agent_id: &AgentId) -> StandResult<DeliveryRequest> {
    let positions = self.queue.lock_positions().await;
    let request = self.requests.get(id).await?;
    check_holder(&request, agent_id, RequestStatus::Assigned)?;
    let entry = self.active_entry(agent_id).await?;

    let now = Utc::now();
    let mut batch = Batch::new();
    let accepted = self.requests.stage_status(&mut batch, &request, RequestStatus::Accepted, now, |_| {});
    self.requests.stage_history(&mut batch, id, agent_id, HistoryAction::Accepted, now, None);
    self
      .queue
      .stage_removal(&positions, &mut batch, &entry, EntryStatus::Completed, false, now)
      .await?;
    self.store.commit(batch).await?;

    info!("Agent {} accepted request {} and left position {}", agent_id, id, entry.position);
    Ok(accepted)
  }

  pub async fn reject(&self, id: RequestId, agent_id: &AgentId, reason: Option<String>) -> StandResult<DeliveryRequest> {
    let reason = reason.map(|r| r.trim().to_owned()).filter(|r| !r.is_empty());
    retry::on_conflict(&self.policy, || self.try_reject(id, agent_id, reason.clone())).await
  }

  async fn try_reject(&self, id: RequestId, agent_id: &AgentId, reason: Option<String>) -> StandResult<DeliveryRequest> {
    let _positions = self.queue.lock_positions().await;
    let request = self.requests.get(id).await?;
    check_holder(&request, agent_id, RequestStatus::Assigned)?;
    let entry = self.active_entry(agent_id).await?;

    let now = Utc::now();
    let mut batch = Batch::new();
    let rejected = self.requests.stage_status(&mut batch, &request, RequestStatus::Rejected, now, |r| {
      r.agent = None;
      r.rejected_by.insert(agent_id.clone());
    });
    self.requests.stage_history(&mut batch, id, agent_id, HistoryAction::Rejected, now, reason);
    self.queue.stage_status(&mut batch, &entry, EntryStatus::Waiting, now)?;
    self.store.commit(batch).await?;

    info!(
      "Agent {} rejected request {} and is back at position {} ({} rejections)",
      agent_id,
      id,
      entry.position,
      rejected.rejection_count()
    );
    Ok(rejected)
  }

  pub async fn advance(&self, id: RequestId, agent_id: &AgentId, status: RequestStatus) -> StandResult<DeliveryRequest> {
    let request = self.requests.get(id).await?;
    if !request.is_held_by(agent_id) {
      return Err(StandError::NotYours(id));
    }
    if request.status.advance_successor() != Some(status) {
      return Err(StandError::request_transition(request.status, status));
    }
    self.requests.update_status(&request, status).await
  }

  /// Terminal write on behalf of the cancellation collaborator. An agent
  /// still holding the request as `assigned` goes back to waiting.
  pub async fn cancel(&self, id: RequestId) -> StandResult<DeliveryRequest> {
    retry::on_conflict(&self.policy, || self.try_cancel(id)).await
  }

  async fn try_cancel(&self, id: RequestId) -> StandResult<DeliveryRequest> {
    let _positions = self.queue.lock_positions().await;
    let request = self.requests.get(id).await?;
    if !request.status.is_cancellable() {
      return Err(StandError::request_transition(request.status, RequestStatus::Cancelled));
    }

    let now = Utc::now();
    let mut batch = Batch::new();
    let cancelled = self.requests.stage_status(&mut batch, &request, RequestStatus::Cancelled, now, |_| {});
    if request.status == RequestStatus::Assigned {
      if let Some(holder) = request.agent_id() {
        let entry = self.active_entry(holder).await?;
        self.queue.stage_status(&mut batch, &entry, EntryStatus::Waiting, now)?;
      }
    }
    self.store.commit(batch).await?;

    info!("Request {} cancelled from {}", id, request.status);
    Ok(cancelled)
  }

  /// Manual re-triage: a rejected request becomes dispatchable again.
  pub async fn requeue(&self, id: RequestId) -> StandResult<DeliveryRequest> {
    let request = self.requests.get(id).await?;
    if request.status != RequestStatus::Rejected {
      return Err(StandError::request_transition(request.status, RequestStatus::Pending));
    }
    self.requests.update_status(&request, RequestStatus::Pending).await
  }
}
