use serde::Deserialize;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::StandError;
use crate::ids::{AgentId, ClientId, RequestId};
use crate::models::{NewDeliveryRequest, RequestStatus};
use crate::routes::{json_body, reject, with_stand};
use crate::stand::Stand;
use crate::store::{RequestFilter, Store};

#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
  /// Comma-separated statuses.
  pub status: Option<String>,
  pub agent_id: Option<String>,
  pub client_id: Option<String>,
}

impl RequestQuery {
  pub fn to_filter(&self) -> Result<RequestFilter, StandError> {
    let statuses = match &self.status {
      Some(list) => list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<RequestStatus>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(StandError::Validation)?,
      None => Vec::new(),
    };
    Ok(RequestFilter {
      statuses,
      agent_id: self.agent_id.clone().map(AgentId::from),
      client_id: self.client_id.clone().map(ClientId::from),
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct AgentAction {
  pub agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
pub struct RejectAction {
  pub agent_id: AgentId,
  pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceAction {
  pub agent_id: AgentId,
  pub status: RequestStatus,
}

#[derive(Debug, Deserialize)]
pub struct FinalCost {
  pub cost: f64,
}

pub fn request_routes<S: Store>(stand: Stand<S>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let create = warp::path!("requests")
    .and(warp::post())
    .and(json_body::<NewDeliveryRequest>())
    .and(with_stand(stand.clone()))
    .and_then(handle_create::<S>);

  let list = warp::path!("requests")
    .and(warp::get())
    .and(warp::query::<RequestQuery>())
    .and(with_stand(stand.clone()))
    .and_then(handle_list::<S>);

  let get = warp::path!("requests" / Uuid)
    .and(warp::get())
    .and(with_stand(stand.clone()))
    .and_then(handle_get::<S>);

  let history = warp::path!("requests" / Uuid / "history")
    .and(warp::get())
    .and(with_stand(stand.clone()))
    .and_then(handle_history::<S>);

  let assign = warp::path!("requests" / Uuid / "assign")
    .and(warp::post())
    .and(with_stand(stand.clone()))
    .and_then(handle_assign::<S>);

  let accept = warp::path!("requests" / Uuid / "accept")
    .and(warp::post())
    .and(json_body::<AgentAction>())
    .and(with_stand(stand.clone()))
    .and_then(handle_accept::<S>);

  let reject_route = warp::path!("requests" / Uuid / "reject")
    .and(warp::post())
    .and(json_body::<RejectAction>())
    .and(with_stand(stand.clone()))
    .and_then(handle_reject::<S>);

  let advance = warp::path!("requests" / Uuid / "advance")
    .and(warp::post())
    .and(json_body::<AdvanceAction>())
    .and(with_stand(stand.clone()))
    .and_then(handle_advance::<S>);

  let cancel = warp::path!("requests" / Uuid / "cancel")
    .and(warp::post())
    .and(with_stand(stand.clone()))
    .and_then(handle_cancel::<S>);

  let requeue = warp::path!("requests" / Uuid / "requeue")
    .and(warp::post())
    .and(with_stand(stand.clone()))
    .and_then(handle_requeue::<S>);

  let final_cost = warp::path!("requests" / Uuid / "final-cost")
    .and(warp::post())
    .and(json_body::<FinalCost>())
    .and(with_stand(stand))
    .and_then(handle_final_cost::<S>);

  create
    .or(list)
    .or(get)
    .or(history)
    .or(assign)
    .or(accept)
    .or(reject_route)
    .or(advance)
    .or(cancel)
    .or(requeue)
    .or(final_cost)
}

async fn handle_create<S: Store>(new: NewDeliveryRequest, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.requests.create(new).await.map_err(reject)?;
  Ok(warp::reply::with_status(warp::reply::json(&request), StatusCode::CREATED))
}

async fn handle_list<S: Store>(query: RequestQuery, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let filter = query.to_filter().map_err(reject)?;
  let requests = stand.requests.list(filter).await.map_err(reject)?;
  Ok(warp::reply::json(&requests))
}

async fn handle_get<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.requests.get(RequestId(id)).await.map_err(reject)?;
  Ok(warp::reply::json(&request))
}

async fn handle_history<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let id = RequestId(id);
  stand.requests.get(id).await.map_err(reject)?;
  let history = stand.requests.history(id).await.map_err(reject)?;
  Ok(warp::reply::json(&history))
}

async fn handle_assign<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let assignment = stand.dispatcher.assign_with_retry(RequestId(id)).await.map_err(reject)?;
  Ok(warp::reply::json(&assignment))
}

async fn handle_accept<S: Store>(id: Uuid, action: AgentAction, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.assignments.accept(RequestId(id), &action.agent_id).await.map_err(reject)?;
  Ok(warp::reply::json(&request))
}

async fn handle_reject<S: Store>(id: Uuid, action: RejectAction, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let rejection = stand.reject(RequestId(id), &action.agent_id, action.reason).await.map_err(reject)?;
  Ok(warp::reply::json(&rejection))
}

async fn handle_advance<S: Store>(id: Uuid, action: AdvanceAction, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand
    .assignments
    .advance(RequestId(id), &action.agent_id, action.status)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&request))
}

async fn handle_cancel<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.assignments.cancel(RequestId(id)).await.map_err(reject)?;
  Ok(warp::reply::json(&request))
}

async fn handle_requeue<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.assignments.requeue(RequestId(id)).await.map_err(reject)?;
  Ok(warp::reply::json(&request))
}

async fn handle_final_cost<S: Store>(id: Uuid, body: FinalCost, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let request = stand.requests.record_final_cost(RequestId(id), body.cost).await.map_err(reject)?;
  Ok(warp::reply::json(&request))
}
