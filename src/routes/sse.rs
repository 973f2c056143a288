use futures::{Stream, StreamExt};
use serde::Serialize;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use crate::error::StandResult;
use crate::routes::requests::RequestQuery;
use crate::routes::{reject, with_stand};
use crate::stand::Stand;
use crate::store::Store;

pub fn sse_routes<S: Store>(stand: Stand<S>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let queue = warp::path!("sse" / "queue")
    .and(warp::get())
    .and(with_stand(stand.clone()))
    .and_then(handle_queue_sse::<S>);

  let requests = warp::path!("sse" / "requests")
    .and(warp::get())
    .and(warp::query::<RequestQuery>())
    .and(with_stand(stand))
    .and_then(handle_requests_sse::<S>);

  queue.or(requests)
}

fn to_events<T, St>(snapshots: St) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static
where
  T: Serialize + Send + 'static,
  St: Stream<Item = StandResult<Vec<T>>> + Send + 'static,
{
  snapshots.map(|snapshot| match snapshot {
    Ok(snapshot) => Event::default().event("snapshot").json_data(&snapshot),
    Err(e) => Ok(Event::default().event("error").data(e.to_string())),
  })
}

async fn handle_queue_sse<S: Store>(stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let stream = to_events(stand.queue.subscribe());
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}

async fn handle_requests_sse<S: Store>(query: RequestQuery, stand: Stand<S>) -> Result<impl Reply, Rejection> {
  let filter = query.to_filter().map_err(reject)?;
  let stream = to_events(stand.requests.subscribe(filter));
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}

#[cfg(test)]
mod tests {
  use super::*;

  use futures::stream;

  use crate::error::StandError;

  #[tokio::test]
  async fn snapshots_and_failures_both_become_events() {
    let snapshots = stream::iter(vec![Ok(vec![1u32, 2]), Err(StandError::QueueEmpty)]);
    let events: Vec<String> = to_events(snapshots)
      .map(|event| event.map(|e| e.to_string()))
      .collect::<Vec<_>>()
      .await
      .into_iter()
      .collect::<Result<_, _>>()
      .unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].contains("snapshot") && events[0].contains("[1,2]"));
    assert!(events[1].contains("error") && events[1].contains("no agent is waiting"));
  }
}
