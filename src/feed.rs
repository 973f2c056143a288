//! Live snapshot streams for UI-facing callers.
//!
//! A stream yields the current result of `read` immediately, then a fresh
//! result after every relevant committed write. Identical consecutive
//! snapshots are suppressed. A lagging subscriber just re-reads.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt, stream};
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StandResult;
use crate::store::{Store, StoreResult, Write};

struct Feed<S, T, R> {
  store: Arc<S>,
  changes: BroadcastStream<Write>,
  relevant: fn(&Write) -> bool,
  read: R,
  last: Option<Vec<T>>,
  primed: bool,
}

pub fn snapshots<S, T, R, Fut>(
  store: Arc<S>,
  relevant: fn(&Write) -> bool,
  read: R,
) -> impl Stream<Item = StandResult<Vec<T>>> + Send + 'static
where
  S: Store,
  T: PartialEq + Clone + Send + 'static,
  R: Fn(Arc<S>) -> Fut + Send + 'static,
  Fut: Future<Output = StoreResult<Vec<T>>> + Send + 'static,
{
  // Subscribe before the first read so nothing committed in between is missed.
  let changes = BroadcastStream::new(store.changes());
  let feed = Feed { store, changes, relevant, read, last: None, primed: false };

  stream::unfold(feed, |mut feed| async move {
    loop {
      if feed.primed {
        match feed.changes.next().await {
          None => return None,
          Some(Ok(write)) if !(feed.relevant)(&write) => continue,
          Some(_) => {}
        }
      }
      feed.primed = true;

      let snapshot = match (feed.read)(feed.store.clone()).await {
        Ok(snapshot) => snapshot,
        Err(e) => return Some((Err(e.into()), feed)),
      };
      if feed.last.as_ref() == Some(&snapshot) {
        continue;
      }
      feed.last = Some(snapshot.clone());
      return Some((Ok(snapshot), feed));
    }
  })
}
