use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use tracing::info;

use crate::error::{StandError, StandResult};
use crate::feed;
use crate::ids::{AgentId, RequestId};
use crate::models::{DeliveryRequest, HistoryAction, HistoryRecord, Location, NewDeliveryRequest, RequestStatus, Timeline};
use crate::store::{Batch, Precondition, RequestFilter, Store, Write};

fn validate_location(label: &str, location: &Location) -> StandResult<()> {
  if location.address.trim().is_empty() || location.contact_name.trim().is_empty() {
    return Err(StandError::Validation(format!("{} address and contact are required", label)));
  }
  if location.contact_phone.trim().is_empty() {
    return Err(StandError::Validation(format!("{} contact phone is required", label)));
  }
  if !(-90.0..=90.0).contains(&location.latitude) || !(-180.0..=180.0).contains(&location.longitude) {
    return Err(StandError::Validation(format!("{} coordinates out of range", label)));
  }
  Ok(())
}

fn validate_new(new: &NewDeliveryRequest) -> StandResult<()> {
  if new.client_id.as_str().trim().is_empty() {
    return Err(StandError::Validation("client id is required".into()));
  }
  if new.item_description.trim().is_empty() {
    return Err(StandError::Validation("item description is required".into()));
  }
  if !new.distance.is_finite() || new.distance < 0.0 {
    return Err(StandError::Validation("distance must be a non-negative number".into()));
  }
  if !new.estimated_cost.is_finite() || new.estimated_cost < 0.0 {
    return Err(StandError::Validation("estimated cost must be a non-negative number".into()));
  }
  validate_location("pickup", &new.pickup)?;
  validate_location("delivery", &new.delivery)
}

pub struct RequestStore<S> {
  store: Arc<S>,
}

impl<S> Clone for RequestStore<S> {
  fn clone(&self) -> Self {
    Self { store: self.store.clone() }
  }
}

impl<S: Store> RequestStore<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  pub async fn create(&self, new: NewDeliveryRequest) -> StandResult<DeliveryRequest> {
    validate_new(&new)?;
    let now = Utc::now();
    let request = DeliveryRequest {
      id: RequestId::new(),
      client_id: new.client_id,
      pickup: new.pickup,
      delivery: new.delivery,
      item_description: new.item_description.trim().to_owned(),
      distance: new.distance,
      estimated_cost: new.estimated_cost,
      final_cost: None,
      status: RequestStatus::Pending,
      agent: None,
      rejected_by: BTreeSet::new(),
      timeline: Timeline::default(),
      created_at: now,
      updated_at: now,
    };
    let mut batch = Batch::new();
    batch.write(Write::PutRequest(request.clone()));
    self.store.commit(batch).await?;
    info!("Delivery request {} created for client {}", request.id, request.client_id);
    Ok(request)
  }

  pub async fn get(&self, id: RequestId) -> StandResult<DeliveryRequest> {
    self.store.request(id).await?.ok_or(StandError::NoRequest(id))
  }

  pub async fn list(&self, filter: RequestFilter) -> StandResult<Vec<DeliveryRequest>> {
    Ok(self.store.requests(filter).await?)
  }

  pub async fn history(&self, id: RequestId) -> StandResult<Vec<HistoryRecord>> {
    Ok(self.store.history(id).await?)
  }

  /// Write `status` onto the request as it was read in `request`, stamping
  /// the status's timestamp. Fails with `Conflict` if the stored status has
  /// moved since. Edge validity is the caller's concern.
  pub async fn update_status(&self, request: &DeliveryRequest, status: RequestStatus) -> StandResult<DeliveryRequest> {
    let mut batch = Batch::new();
    let updated = self.stage_status(&mut batch, request, status, Utc::now(), |_| {});
    self.store.commit(batch).await?;
    info!("Delivery request {} moved {} -> {}", request.id, request.status, status);
    Ok(updated)
  }

  /// Stage a status change on top of the snapshot `request`. `edit` adjusts
  /// the other fields that travel with the change.
  pub fn stage_status(
    &self,
    batch: &mut Batch,
    request: &DeliveryRequest,
    status: RequestStatus,
    at: DateTime<Utc>,
    edit: impl FnOnce(&mut DeliveryRequest),
  ) -> DeliveryRequest {
    let mut updated = request.clone();
    edit(&mut updated);
    updated.status = status;
    *updated.timeline.slot_mut(status) = Some(at);
    updated.updated_at = at;
    batch
      .require(Precondition::RequestStatus { id: request.id, expected: request.status })
      .write(Write::PutRequest(updated.clone()));
    updated
  }

  pub fn stage_history(
    &self,
    batch: &mut Batch,
    request_id: RequestId,
    agent_id: &AgentId,
    action: HistoryAction,
    at: DateTime<Utc>,
    reason: Option<String>,
  ) {
    batch.write(Write::AppendHistory(HistoryRecord {
      request_id,
      agent_id: agent_id.clone(),
      action,
      timestamp: at,
      reason,
    }));
  }

  pub async fn record_final_cost(&self, id: RequestId, cost: f64) -> StandResult<DeliveryRequest> {
    if !cost.is_finite() || cost < 0.0 {
      return Err(StandError::Validation("final cost must be a non-negative number".into()));
    }
    let request = self.get(id).await?;
    if !matches!(request.status, RequestStatus::Delivered | RequestStatus::Completed) {
      return Err(StandError::InvalidState(format!("request is {}", request.status)));
    }
    let now = Utc::now();
    let updated = DeliveryRequest { final_cost: Some(cost), updated_at: now, ..request.clone() };
    let mut batch = Batch::new();
    batch
      .require(Precondition::RequestStatus { id, expected: request.status })
      .write(Write::PutRequest(updated.clone()));
    self.store.commit(batch).await?;
    Ok(updated)
  }

  /// Snapshots of the requests matching `filter`, refreshed on every request
  /// write. For callers outside the engine; the engine itself always re-reads.
  pub fn subscribe(
    &self,
    filter: RequestFilter,
  ) -> impl Stream<Item = StandResult<Vec<DeliveryRequest>>> + Send + use<S> {
    feed::snapshots(
      self.store.clone(),
      |w| matches!(w, Write::PutRequest(_)),
      move |store: Arc<S>| {
        let filter = filter.clone();
        async move { store.requests(filter).await }
      },
    )
  }
}
