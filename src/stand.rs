use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::assignment::Assignments;
use crate::config::Policy;
use crate::dispatcher::Dispatcher;
use crate::error::{StandError, StandResult};
use crate::ids::{AgentId, RequestId};
use crate::models::{Assignment, DeliveryRequest};
use crate::queue::QueueStore;
use crate::requests::RequestStore;
use crate::store::Store;

/// What happened to a request after its agent turned it down.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Redispatch {
  /// Left `rejected` for manual re-triage.
  Disabled,
  Assigned(Assignment),
  /// Back to `pending` but nobody eligible was waiting.
  Pending { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
  pub request: DeliveryRequest,
  pub redispatch: Redispatch,
}

/// One stand: the queue, the requests, and the two machines that move them,
/// all sharing a store.
pub struct Stand<S> {
  pub queue: QueueStore<S>,
  pub requests: RequestStore<S>,
  pub dispatcher: Dispatcher<S>,
  pub assignments: Assignments<S>,
  policy: Policy,
}

impl<S> Clone for Stand<S> {
  fn clone(&self) -> Self {
    Self {
      queue: self.queue.clone(),
      requests: self.requests.clone(),
      dispatcher: self.dispatcher.clone(),
      assignments: self.assignments.clone(),
      policy: self.policy.clone(),
    }
  }
}

impl<S: Store> Stand<S> {
  pub fn new(store: Arc<S>, policy: Policy) -> Self {
    let queue = QueueStore::new(store.clone(), policy.clone());
    let requests = RequestStore::new(store.clone());
    let dispatcher = Dispatcher::new(store.clone(), queue.clone(), requests.clone(), policy.clone());
    let assignments = Assignments::new(store, queue.clone(), requests.clone(), policy.clone());
    Self { queue, requests, dispatcher, assignments, policy }
  }

  pub fn policy(&self) -> &Policy {
    &self.policy
  }

  /// Reject, then hand the request to the next eligible agent when the
  /// policy asks for it.
  pub async fn reject(&self, id: RequestId, agent_id: &AgentId, reason: Option<String>) -> StandResult<Rejection> {
    let rejected = self.assignments.reject(id, agent_id, reason).await?;
    if !self.policy.redispatch_on_reject {
      return Ok(Rejection { request: rejected, redispatch: Redispatch::Disabled });
    }

    let requeued = self.assignments.requeue(id).await?;
    match self.dispatcher.redispatch(id).await {
      Ok(assignment) => {
        info!("Request {} redispatched to agent {}", id, assignment.agent_id);
        let request = self.requests.get(id).await?;
        Ok(Rejection { request, redispatch: Redispatch::Assigned(assignment) })
      }
      Err(e @ (StandError::QueueEmpty | StandError::Conflict)) => {
        warn!("Request {} requeued but not redispatched: {}", id, e);
        Ok(Rejection { request: requeued, redispatch: Redispatch::Pending { reason: e.to_string() } })
      }
      Err(e) => Err(e),
    }
  }
}
