use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ClientId, EntryId, RequestId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
  Waiting,
  Active,
  Completed,
  Cancelled,
}

impl EntryStatus {
  pub const LIVE: [EntryStatus; 2] = [EntryStatus::Waiting, EntryStatus::Active];

  pub fn as_str(self) -> &'static str {
    match self {
      EntryStatus::Waiting => "waiting",
      EntryStatus::Active => "active",
      EntryStatus::Completed => "completed",
      EntryStatus::Cancelled => "cancelled",
    }
  }

  /// Live entries hold a slot in the position space.
  pub fn is_live(self) -> bool {
    matches!(self, EntryStatus::Waiting | EntryStatus::Active)
  }

  pub fn can_transition_to(self, next: EntryStatus) -> bool {
    use EntryStatus::*;
    matches!(
      (self, next),
      (Waiting, Active) | (Active, Waiting) | (Active, Completed) | (Waiting, Cancelled) | (Active, Cancelled)
    )
  }
}

impl fmt::Display for EntryStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
  pub id: EntryId,
  pub agent_id: AgentId,
  pub agent_name: String,
  pub agent_phone: String,
  pub vehicle_type: String,
  pub vehicle_plate: String,
  pub position: u32,
  pub status: EntryStatus,
  pub joined_at: DateTime<Utc>,
  pub last_updated: DateTime<Utc>,
}

/// What an agent supplies when joining the stand.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
  pub agent_id: AgentId,
  pub name: String,
  pub phone: String,
  pub vehicle_type: String,
  pub vehicle_plate: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
  Pending,
  Assigned,
  Accepted,
  PickedUp,
  InTransit,
  Delivered,
  Completed,
  Cancelled,
  Rejected,
}

impl RequestStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      RequestStatus::Pending => "pending",
      RequestStatus::Assigned => "assigned",
      RequestStatus::Accepted => "accepted",
      RequestStatus::PickedUp => "picked_up",
      RequestStatus::InTransit => "in_transit",
      RequestStatus::Delivered => "delivered",
      RequestStatus::Completed => "completed",
      RequestStatus::Cancelled => "cancelled",
      RequestStatus::Rejected => "rejected",
    }
  }

  /// The only status `Advance` may move to from `self`.
  ///
  /// `assigned` has no advance successor: leaving it goes through accept or
  /// reject, which also touch the queue.
  pub fn advance_successor(self) -> Option<RequestStatus> {
    match self {
      RequestStatus::Accepted => Some(RequestStatus::PickedUp),
      RequestStatus::PickedUp => Some(RequestStatus::InTransit),
      RequestStatus::InTransit => Some(RequestStatus::Delivered),
      RequestStatus::Delivered => Some(RequestStatus::Completed),
      _ => None,
    }
  }

  pub fn is_cancellable(self) -> bool {
    matches!(
      self,
      RequestStatus::Pending
        | RequestStatus::Assigned
        | RequestStatus::Accepted
        | RequestStatus::PickedUp
        | RequestStatus::InTransit
        | RequestStatus::Rejected
    )
  }
}

impl fmt::Display for RequestStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for RequestStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "pending" => RequestStatus::Pending,
      "assigned" => RequestStatus::Assigned,
      "accepted" => RequestStatus::Accepted,
      "picked_up" => RequestStatus::PickedUp,
      "in_transit" => RequestStatus::InTransit,
      "delivered" => RequestStatus::Delivered,
      "completed" => RequestStatus::Completed,
      "cancelled" => RequestStatus::Cancelled,
      "rejected" => RequestStatus::Rejected,
      other => return Err(format!("unknown request status '{}'", other)),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
  pub address: String,
  pub latitude: f64,
  pub longitude: f64,
  pub contact_name: String,
  pub contact_phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedAgent {
  pub agent_id: AgentId,
  pub name: String,
  pub phone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
  pub requeued_at: Option<DateTime<Utc>>,
  pub assigned_at: Option<DateTime<Utc>>,
  pub accepted_at: Option<DateTime<Utc>>,
  pub picked_up_at: Option<DateTime<Utc>>,
  pub in_transit_at: Option<DateTime<Utc>>,
  pub delivered_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub cancelled_at: Option<DateTime<Utc>>,
  pub rejected_at: Option<DateTime<Utc>>,
}

impl Timeline {
  /// Every status owns exactly one slot.
  pub fn slot_mut(&mut self, status: RequestStatus) -> &mut Option<DateTime<Utc>> {
    match status {
      RequestStatus::Pending => &mut self.requeued_at,
      RequestStatus::Assigned => &mut self.assigned_at,
      RequestStatus::Accepted => &mut self.accepted_at,
      RequestStatus::PickedUp => &mut self.picked_up_at,
      RequestStatus::InTransit => &mut self.in_transit_at,
      RequestStatus::Delivered => &mut self.delivered_at,
      RequestStatus::Completed => &mut self.completed_at,
      RequestStatus::Cancelled => &mut self.cancelled_at,
      RequestStatus::Rejected => &mut self.rejected_at,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
  pub id: RequestId,
  pub client_id: ClientId,
  pub pickup: Location,
  pub delivery: Location,
  pub item_description: String,
  pub distance: f64,
  pub estimated_cost: f64,
  pub final_cost: Option<f64>,
  pub status: RequestStatus,
  pub agent: Option<AssignedAgent>,
  pub rejected_by: BTreeSet<AgentId>,
  #[serde(flatten)]
  pub timeline: Timeline,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl DeliveryRequest {
  pub fn rejection_count(&self) -> usize {
    self.rejected_by.len()
  }

  pub fn agent_id(&self) -> Option<&AgentId> {
    self.agent.as_ref().map(|a| &a.agent_id)
  }

  pub fn is_held_by(&self, agent_id: &AgentId) -> bool {
    self.agent_id() == Some(agent_id)
  }
}

/// Intake payload; the request is created `pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDeliveryRequest {
  pub client_id: ClientId,
  pub pickup: Location,
  pub delivery: Location,
  pub item_description: String,
  pub distance: f64,
  pub estimated_cost: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
  Accepted,
  Rejected,
  AutoAssigned,
}

impl HistoryAction {
  pub fn as_str(self) -> &'static str {
    match self {
      HistoryAction::Accepted => "accepted",
      HistoryAction::Rejected => "rejected",
      HistoryAction::AutoAssigned => "auto_assigned",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub request_id: RequestId,
  pub agent_id: AgentId,
  pub action: HistoryAction,
  pub timestamp: DateTime<Utc>,
  pub reason: Option<String>,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
  pub request_id: RequestId,
  pub entry_id: EntryId,
  pub agent_id: AgentId,
  pub agent_name: String,
  pub position: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL: [RequestStatus; 9] = [
    RequestStatus::Pending,
    RequestStatus::Assigned,
    RequestStatus::Accepted,
    RequestStatus::PickedUp,
    RequestStatus::InTransit,
    RequestStatus::Delivered,
    RequestStatus::Completed,
    RequestStatus::Cancelled,
    RequestStatus::Rejected,
  ];

  #[test]
  fn each_status_stamps_exactly_one_slot() {
    let at = Utc::now();
    for status in ALL {
      let mut timeline = Timeline::default();
      *timeline.slot_mut(status) = Some(at);
      let json = serde_json::to_value(&timeline).unwrap();
      let stamped = json.as_object().unwrap().values().filter(|v| !v.is_null()).count();
      assert_eq!(stamped, 1, "{} stamped {} slots", status, stamped);
    }
  }

  #[test]
  fn advance_chain_has_no_skips() {
    let mut status = RequestStatus::Accepted;
    let mut chain = vec![status];
    while let Some(next) = status.advance_successor() {
      chain.push(next);
      status = next;
    }
    assert_eq!(
      chain,
      vec![
        RequestStatus::Accepted,
        RequestStatus::PickedUp,
        RequestStatus::InTransit,
        RequestStatus::Delivered,
        RequestStatus::Completed,
      ]
    );
    assert_eq!(RequestStatus::Assigned.advance_successor(), None);
  }

  #[test]
  fn status_names_parse_back() {
    for status in ALL {
      assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
    }
    assert!("lost".parse::<RequestStatus>().is_err());
  }

  #[test]
  fn entry_transitions() {
    assert!(EntryStatus::Waiting.can_transition_to(EntryStatus::Active));
    assert!(EntryStatus::Active.can_transition_to(EntryStatus::Waiting));
    assert!(!EntryStatus::Waiting.can_transition_to(EntryStatus::Completed));
    assert!(!EntryStatus::Cancelled.can_transition_to(EntryStatus::Waiting));
  }
}
