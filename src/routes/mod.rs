use std::convert::Infallible;

use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::StandError;
use crate::stand::Stand;
use crate::store::Store;

pub mod queue;
pub mod requests;
pub mod sse;

const BODY_LIMIT: u64 = 16 * 1024;

#[derive(Debug)]
pub struct ApiError(pub StandError);
impl warp::reject::Reject for ApiError {}

pub fn reject(err: StandError) -> Rejection {
  warp::reject::custom(ApiError(err))
}

fn with_stand<S: Store>(stand: Stand<S>) -> impl Filter<Extract = (Stand<S>,), Error = Infallible> + Clone {
  warp::any().map(move || stand.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
  warp::body::content_length_limit(BODY_LIMIT).and(warp::body::json())
}

pub fn routes<S: Store>(stand: Stand<S>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  queue::queue_routes(stand.clone())
    .or(requests::request_routes(stand.clone()))
    .or(sse::sse_routes(stand))
    .recover(handle_rejection)
}

fn status_for(err: &StandError) -> StatusCode {
  match err {
    StandError::NotFound(_) | StandError::NoEntryForAgent | StandError::NoRequest(_) => StatusCode::NOT_FOUND,
    StandError::AlreadyQueued
    | StandError::AlreadyProcessed(..)
    | StandError::Conflict
    | StandError::InvalidState(_) => StatusCode::CONFLICT,
    StandError::QueueEmpty => StatusCode::SERVICE_UNAVAILABLE,
    StandError::NotYours(_) => StatusCode::FORBIDDEN,
    StandError::InvalidTransition { .. } | StandError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
    StandError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (code, kind, message) = if let Some(ApiError(e)) = err.find::<ApiError>() {
    if let StandError::Store(inner) = e {
      error!("Store failure: {:?}", inner);
    }
    (status_for(e), e.kind(), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not_found", "no such route".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "payload too large".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".to_string())
  };

  let body = warp::reply::json(&json!({ "error": kind, "message": message }));
  Ok(warp::reply::with_status(body, code))
}
