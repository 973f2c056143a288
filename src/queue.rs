//! The stand's FIFO of agents.
//!
//! Live entries (`waiting` or `active`) hold positions `1..=N` in join order.
//! Every write to an entry runs under the position lock and requires the
//! entry's status and position as read. Changes to N (a join, or an entry
//! leaving the position space) also require the live count, so writers in
//! another process lose with a retryable conflict instead of writing back a
//! stale position.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use futures::Stream;
use regex::Regex;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::Policy;
use crate::error::{StandError, StandResult, StoreError};
use crate::feed;
use crate::ids::{AgentId, EntryId};
use crate::models::{AgentProfile, EntryStatus, QueueEntry, RequestStatus};
use crate::requests::RequestStore;
use crate::retry;
use crate::store::{Batch, EntryQuery, Precondition, RequestFilter, Store, Write};

static PHONE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 \-]{5,19}$").expect("phone pattern"));
static PLATE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 \-]{0,11}$").expect("plate pattern"));

fn validate_profile(profile: &AgentProfile) -> StandResult<()> {
  if profile.agent_id.as_str().trim().is_empty() {
    return Err(StandError::Validation("agent id is required".into()));
  }
  if profile.name.trim().is_empty() {
    return Err(StandError::Validation("agent name is required".into()));
  }
  if profile.vehicle_type.trim().is_empty() {
    return Err(StandError::Validation("vehicle type is required".into()));
  }
  if !PHONE.is_match(&profile.phone) {
    return Err(StandError::Validation(format!("invalid phone number '{}'", profile.phone)));
  }
  if !PLATE.is_match(&profile.vehicle_plate) {
    return Err(StandError::Validation(format!("invalid vehicle plate '{}'", profile.vehicle_plate)));
  }
  Ok(())
}

/// Proof that the caller holds the position lock.
pub struct PositionGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

pub struct QueueStore<S> {
  store: Arc<S>,
  requests: RequestStore<S>,
  positions: Arc<Mutex<()>>,
  policy: Policy,
}

impl<S> Clone for QueueStore<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      requests: self.requests.clone(),
      positions: self.positions.clone(),
      policy: self.policy.clone(),
    }
  }
}

impl<S: Store> QueueStore<S> {
  pub fn new(store: Arc<S>, policy: Policy) -> Self {
    let requests = RequestStore::new(store.clone());
    Self { store, requests, positions: Arc::new(Mutex::new(())), policy }
  }

  pub async fn lock_positions(&self) -> PositionGuard<'_> {
    PositionGuard(self.positions.lock().await)
  }

  pub async fn join(&self, profile: AgentProfile) -> StandResult<QueueEntry> {
    validate_profile(&profile)?;
    retry::on_conflict(&self.policy, || self.try_join(&profile)).await
  }

  async fn try_join(&self, profile: &AgentProfile) -> StandResult<QueueEntry> {
    let _positions = self.lock_positions().await;
    let live = self.store.entries(EntryQuery::live()).await?;
    if live.iter().any(|e| e.agent_id == profile.agent_id) {
      return Err(StandError::AlreadyQueued);
    }

    let now = Utc::now();
    let entry = QueueEntry {
      id: EntryId::new(),
      agent_id: profile.agent_id.clone(),
      agent_name: profile.name.trim().to_owned(),
      agent_phone: profile.phone.clone(),
      vehicle_type: profile.vehicle_type.trim().to_owned(),
      vehicle_plate: profile.vehicle_plate.to_uppercase(),
      position: live.len() as u32 + 1,
      status: EntryStatus::Waiting,
      joined_at: now,
      last_updated: now,
    };

    let mut batch = Batch::new();
    batch
      .require(Precondition::AgentNotQueued { agent_id: entry.agent_id.clone() })
      .require(Precondition::LiveCount { expected: live.len() })
      .write(Write::PutEntry(entry.clone()));
    match self.store.commit(batch).await {
      Ok(()) => {}
      Err(StoreError::PreconditionFailed(Precondition::AgentNotQueued { .. })) => {
        return Err(StandError::AlreadyQueued);
      }
      Err(e) => return Err(e.into()),
    }

    info!("Agent {} joined the stand at position {}", entry.agent_id, entry.position);
    Ok(entry)
  }

  /// Take an entry off the stand and close the gap it leaves. An agent who
  /// still holds an `assigned` request hands it back as `pending` in the
  /// same batch.
  pub async fn leave(&self, id: EntryId) -> StandResult<QueueEntry> {
    let left = retry::on_conflict(&self.policy, || self.try_leave(id)).await?;
    info!("Agent {} left the stand from position {}", left.agent_id, left.position);
    if !self.policy.leave_grace.is_zero() {
      self.schedule_purge(&left);
    }
    Ok(left)
  }

  async fn try_leave(&self, id: EntryId) -> StandResult<QueueEntry> {
    let positions = self.lock_positions().await;
    let entry = self.entry(id).await?;
    let now = Utc::now();
    let mut batch = Batch::new();
    let retain = !self.policy.leave_grace.is_zero();
    let left = self
      .stage_removal(&positions, &mut batch, &entry, EntryStatus::Cancelled, retain, now)
      .await?;

    let mut released = Vec::new();
    if entry.status == EntryStatus::Active {
      let held = RequestFilter {
        agent_id: Some(entry.agent_id.clone()),
        ..RequestFilter::status(RequestStatus::Assigned)
      };
      for request in self.requests.list(held).await? {
        self.requests.stage_status(&mut batch, &request, RequestStatus::Pending, now, |r| r.agent = None);
        released.push(request.id);
      }
    }
    self.store.commit(batch).await?;

    for request_id in released {
      info!("Request {} back to pending, agent {} left the stand", request_id, entry.agent_id);
    }
    Ok(left)
  }

  fn schedule_purge(&self, left: &QueueEntry) {
    let store = self.store.clone();
    let grace = self.policy.leave_grace;
    let (id, position) = (left.id, left.position);
    tokio::spawn(async move {
      tokio::time::sleep(grace).await;
      let mut batch = Batch::new();
      batch
        .require(Precondition::EntryState { id, status: EntryStatus::Cancelled, position })
        .write(Write::DeleteEntry(id));
      match store.commit(batch).await {
        Ok(()) => debug!("Purged cancelled entry {}", id),
        Err(e) => warn!("Could not purge cancelled entry {}: {}", id, e),
      }
    });
  }

  /// Waiting entries, front of the stand first.
  pub async fn list(&self) -> StandResult<Vec<QueueEntry>> {
    Ok(self.store.entries(EntryQuery::with_status(&[EntryStatus::Waiting])).await?)
  }

  /// Waiting and active entries, by position.
  pub async fn live(&self) -> StandResult<Vec<QueueEntry>> {
    Ok(self.store.entries(EntryQuery::live()).await?)
  }

  pub async fn head(&self) -> StandResult<Option<QueueEntry>> {
    let mut front = self.store.entries(EntryQuery::with_status(&[EntryStatus::Waiting]).limit(1)).await?;
    Ok(front.pop())
  }

  /// First waiting entry whose agent is not in `excluded`.
  pub async fn head_excluding(&self, excluded: &BTreeSet<AgentId>) -> StandResult<Option<QueueEntry>> {
    if excluded.is_empty() {
      return self.head().await;
    }
    Ok(self.list().await?.into_iter().find(|e| !excluded.contains(&e.agent_id)))
  }

  pub async fn entry(&self, id: EntryId) -> StandResult<QueueEntry> {
    self.store.entry(id).await?.ok_or(StandError::NotFound(id))
  }

  pub async fn live_entry_for(&self, agent_id: &AgentId) -> StandResult<Option<QueueEntry>> {
    let mut found = self.store.entries(EntryQuery::live().agent(agent_id).limit(1)).await?;
    Ok(found.pop())
  }

  /// Move an entry along its lifecycle on its own. Leaving the position
  /// space (`completed`, `cancelled`) compacts the positions behind it.
  pub async fn set_status(&self, id: EntryId, status: EntryStatus) -> StandResult<QueueEntry> {
    retry::on_conflict(&self.policy, || self.try_set_status(id, status)).await
  }

  async fn try_set_status(&self, id: EntryId, status: EntryStatus) -> StandResult<QueueEntry> {
    let positions = self.lock_positions().await;
    let entry = self.entry(id).await?;
    let now = Utc::now();
    let mut batch = Batch::new();
    let updated = if status.is_live() {
      self.stage_status(&mut batch, &entry, status, now)?
    } else {
      self.stage_removal(&positions, &mut batch, &entry, status, true, now).await?
    };
    self.store.commit(batch).await?;
    debug!("Entry {} moved {} -> {}", id, entry.status, status);
    Ok(updated)
  }

  /// Stage a status change that keeps the entry's position. `entry` must
  /// have been read under the position lock.
  pub fn stage_status(
    &self,
    batch: &mut Batch,
    entry: &QueueEntry,
    status: EntryStatus,
    at: DateTime<Utc>,
  ) -> StandResult<QueueEntry> {
    if !entry.status.can_transition_to(status) || !status.is_live() {
      return Err(StandError::entry_transition(entry.status, status));
    }
    let updated = QueueEntry { status, last_updated: at, ..entry.clone() };
    batch.require(held_at(entry)).write(Write::PutEntry(updated.clone()));
    Ok(updated)
  }

  /// Stage the entry leaving the position space, either kept with its final
  /// status or deleted outright, plus the compaction behind it.
  pub async fn stage_removal(
    &self,
    _positions: &PositionGuard<'_>,
    batch: &mut Batch,
    entry: &QueueEntry,
    status: EntryStatus,
    retain: bool,
    at: DateTime<Utc>,
  ) -> StandResult<QueueEntry> {
    if !entry.status.can_transition_to(status) || status.is_live() {
      return Err(StandError::entry_transition(entry.status, status));
    }
    let live = self.store.entries(EntryQuery::live()).await?;
    batch.require(held_at(entry)).require(Precondition::LiveCount { expected: live.len() });

    let removed = QueueEntry { status, last_updated: at, ..entry.clone() };
    if retain {
      batch.write(Write::PutEntry(removed.clone()));
    } else {
      batch.write(Write::DeleteEntry(entry.id));
    }
    let shifted = reorder(batch, &live, entry.position, at);
    debug!("Compaction after position {} shifts {} entries", entry.position, shifted);
    Ok(removed)
  }

  /// Waiting-list snapshots, re-read whenever an entry changes.
  pub fn subscribe(&self) -> impl Stream<Item = StandResult<Vec<QueueEntry>>> + Send + use<S> {
    feed::snapshots(
      self.store.clone(),
      |w| matches!(w, Write::PutEntry(_) | Write::DeleteEntry(_)),
      |store: Arc<S>| async move { store.entries(EntryQuery::with_status(&[EntryStatus::Waiting])).await },
    )
  }
}

fn held_at(entry: &QueueEntry) -> Precondition {
  Precondition::EntryState { id: entry.id, status: entry.status, position: entry.position }
}

/// Stage a one-step decrement for every live entry behind `after_position`.
/// Relative order is untouched, and each shifted entry must still be as read.
fn reorder(batch: &mut Batch, live: &[QueueEntry], after_position: u32, at: DateTime<Utc>) -> usize {
  let mut shifted = 0;
  for entry in live.iter().filter(|e| e.position > after_position) {
    batch
      .require(held_at(entry))
      .write(Write::PutEntry(QueueEntry { position: entry.position - 1, last_updated: at, ..entry.clone() }));
    shifted += 1;
  }
  shifted
}

#[cfg(test)]
mod tests {
  use super::*;

  fn profile(agent: &str) -> AgentProfile {
    AgentProfile {
      agent_id: agent.into(),
      name: "Ama".into(),
      phone: "+233 24 555 0101".into(),
      vehicle_type: "motorbike".into(),
      vehicle_plate: "GR-1234-20".into(),
    }
  }

  #[test]
  fn profile_validation() {
    assert!(validate_profile(&profile("a1")).is_ok());

    let mut bad_phone = profile("a1");
    bad_phone.phone = "call me".into();
    assert!(matches!(validate_profile(&bad_phone), Err(StandError::Validation(_))));

    let mut bad_plate = profile("a1");
    bad_plate.vehicle_plate = "<script>".into();
    assert!(matches!(validate_profile(&bad_plate), Err(StandError::Validation(_))));

    let mut no_name = profile("a1");
    no_name.name = "  ".into();
    assert!(matches!(validate_profile(&no_name), Err(StandError::Validation(_))));
  }

  #[test]
  fn reorder_only_touches_entries_behind_the_gap() {
    let now = Utc::now();
    let live: Vec<QueueEntry> = (1..=4)
      .filter(|p| *p != 2)
      .map(|position| QueueEntry {
        id: EntryId::new(),
        agent_id: format!("a{}", position).into(),
        agent_name: "x".into(),
        agent_phone: "+1000000".into(),
        vehicle_type: "car".into(),
        vehicle_plate: "AB1".into(),
        position,
        status: EntryStatus::Waiting,
        joined_at: now,
        last_updated: now,
      })
      .collect();
    let mut batch = Batch::new();
    assert_eq!(reorder(&mut batch, &live, 2, now), 2);
    let positions: Vec<u32> = batch
      .writes
      .iter()
      .map(|w| match w {
        Write::PutEntry(e) => e.position,
        other => panic!("unexpected write {:?}", other),
      })
      .collect();
    assert_eq!(positions, vec![2, 3]);
    let guarded = |p: &Precondition| matches!(p, Precondition::EntryState { position, .. } if *position > 2);
    assert!(batch.preconditions.iter().all(guarded));
    assert_eq!(batch.preconditions.len(), 2);
  }
}
