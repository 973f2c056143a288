use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::ids::EntryId;
use crate::models::AgentProfile;
use crate::routes::{json_body, reject, with_stand};
use crate::stand::Stand;
use crate::store::Store;

pub fn queue_routes<S: Store>(stand: Stand<S>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let join = warp::path!("queue")
    .and(warp::post())
    .and(json_body::<AgentProfile>())
    .and(with_stand(stand.clone()))
    .and_then(handle_join::<S>);

  let list = warp::path!("queue")
    .and(warp::get())
    .and(with_stand(stand.clone()))
    .and_then(handle_list::<S>);

  let head = warp::path!("queue" / "head")
    .and(warp::get())
    .and(with_stand(stand.clone()))
    .and_then(handle_head::<S>);

  let leave = warp::path!("queue" / Uuid)
    .and(warp::delete())
    .and(with_stand(stand))
    .and_then(handle_leave::<S>);

  join.or(list).or(head).or(leave)
}

async fn handle_join<S: Store>(profile: AgentProfile, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let entry = stand.queue.join(profile).await.map_err(reject)?;
  Ok(warp::reply::with_status(warp::reply::json(&entry), StatusCode::CREATED))
}

async fn handle_list<S: Store>(stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let entries = stand.queue.list().await.map_err(reject)?;
  Ok(warp::reply::json(&entries))
}

async fn handle_head<S: Store>(stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let head = stand.queue.head().await.map_err(reject)?;
  Ok(warp::reply::json(&head))
}

async fn handle_leave<S: Store>(id: Uuid, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let left = stand.queue.leave(EntryId(id)).await.map_err(reject)?;
  Ok(warp::reply::json(&left))
}
