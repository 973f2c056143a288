use sqlx::types::Json;
use sqlx::{PgConnection, Pool, Postgres};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::ids::{EntryId, RequestId};
use crate::models::{DeliveryRequest, HistoryRecord, QueueEntry};
use crate::store::{Batch, CHANGE_FEED_CAPACITY, EntryQuery, Precondition, RequestFilter, Store, StoreResult, Write};

/// Postgres-backed store. Documents live in JSONB `body` columns next to the
/// columns the engine filters and sorts on. Commits run `SERIALIZABLE`.
///
/// The change feed only reports commits made through this handle.
#[derive(Clone)]
pub struct PgStore {
  pool: Pool<Postgres>,
  feed: broadcast::Sender<Write>,
}

impl PgStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    Self { pool, feed }
  }
}

/// Serialization failures and unique-index races both mean another writer got
/// there first.
fn classify(err: sqlx::Error) -> StoreError {
  let racing = err
    .as_database_error()
    .and_then(|db| db.code())
    .is_some_and(|code| code == "40001" || code == "23505");
  if racing { StoreError::Serialization } else { StoreError::Database(err) }
}

async fn holds(conn: &mut PgConnection, precondition: &Precondition) -> Result<bool, sqlx::Error> {
  let held = match precondition {
    Precondition::EntryState { id, status, position } => {
      let row: Option<(String, i32)> =
        sqlx::query_as("SELECT status, position FROM queue_entries WHERE id = $1 FOR UPDATE")
          .bind(id.0)
          .fetch_optional(&mut *conn)
          .await?;
      row.is_some_and(|(s, p)| s == status.as_str() && p == *position as i32)
    }
    Precondition::RequestStatus { id, expected } => {
      let status: Option<String> = sqlx::query_scalar("SELECT status FROM delivery_requests WHERE id = $1 FOR UPDATE")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
      status.as_deref() == Some(expected.as_str())
    }
    Precondition::AgentNotQueued { agent_id } => {
      let live: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM queue_entries WHERE agent_id = $1 AND status IN ('waiting', 'active')",
      )
        .bind(agent_id.as_str())
        .fetch_one(&mut *conn)
        .await?;
      live == 0
    }
    Precondition::LiveCount { expected } => {
      let live: i64 = sqlx::query_scalar("SELECT count(*) FROM queue_entries WHERE status IN ('waiting', 'active')")
        .fetch_one(&mut *conn)
        .await?;
      live == *expected as i64
    }
  };
  Ok(held)
}

async fn apply(conn: &mut PgConnection, write: &Write) -> Result<(), sqlx::Error> {
  match write {
    Write::PutEntry(entry) => {
      sqlx::query(
        "INSERT INTO queue_entries (id, agent_id, status, position, joined_at, body)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, position = EXCLUDED.position, body = EXCLUDED.body",
      )
        .bind(entry.id.0)
        .bind(entry.agent_id.as_str())
        .bind(entry.status.as_str())
        .bind(entry.position as i32)
        .bind(entry.joined_at)
        .bind(Json(entry))
        .execute(&mut *conn)
        .await?;
    }
    Write::DeleteEntry(id) => {
      sqlx::query("DELETE FROM queue_entries WHERE id = $1").bind(id.0).execute(&mut *conn).await?;
    }
    Write::PutRequest(request) => {
      sqlx::query(
        "INSERT INTO delivery_requests (id, client_id, agent_id, status, created_at, body)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET agent_id = EXCLUDED.agent_id, status = EXCLUDED.status, body = EXCLUDED.body",
      )
        .bind(request.id.0)
        .bind(request.client_id.as_str())
        .bind(request.agent_id().map(|a| a.as_str()))
        .bind(request.status.as_str())
        .bind(request.created_at)
        .bind(Json(request))
        .execute(&mut *conn)
        .await?;
    }
    Write::AppendHistory(record) => {
      sqlx::query(
        "INSERT INTO assignment_history (request_id, agent_id, action, recorded_at, body) VALUES ($1, $2, $3, $4, $5)",
      )
        .bind(record.request_id.0)
        .bind(record.agent_id.as_str())
        .bind(record.action.as_str())
        .bind(record.timestamp)
        .bind(Json(record))
        .execute(&mut *conn)
        .await?;
    }
  }
  Ok(())
}

impl Store for PgStore {
  async fn entry(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
    let body: Option<Json<QueueEntry>> = sqlx::query_scalar("SELECT body FROM queue_entries WHERE id = $1")
      .bind(id.0)
      .fetch_optional(&self.pool)
      .await?;
    Ok(body.map(|b| b.0))
  }

  async fn entries(&self, query: EntryQuery) -> StoreResult<Vec<QueueEntry>> {
    let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_owned()).collect();
    let rows: Vec<Json<QueueEntry>> = sqlx::query_scalar(
      "SELECT body FROM queue_entries
       WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
         AND ($2::text IS NULL OR agent_id = $2)
         AND ($3::bigint IS NULL OR position > $3)
       ORDER BY position, joined_at
       LIMIT $4",
    )
      .bind(statuses)
      .bind(query.agent_id.as_ref().map(|a| a.as_str()))
      .bind(query.after_position.map(i64::from))
      .bind(query.limit.map(|l| l as i64))
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(|b| b.0).collect())
  }

  async fn request(&self, id: RequestId) -> StoreResult<Option<DeliveryRequest>> {
    let body: Option<Json<DeliveryRequest>> = sqlx::query_scalar("SELECT body FROM delivery_requests WHERE id = $1")
      .bind(id.0)
      .fetch_optional(&self.pool)
      .await?;
    Ok(body.map(|b| b.0))
  }

  async fn requests(&self, filter: RequestFilter) -> StoreResult<Vec<DeliveryRequest>> {
    let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_owned()).collect();
    let rows: Vec<Json<DeliveryRequest>> = sqlx::query_scalar(
      "SELECT body FROM delivery_requests
       WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
         AND ($2::text IS NULL OR agent_id = $2)
         AND ($3::text IS NULL OR client_id = $3)
       ORDER BY created_at, id",
    )
      .bind(statuses)
      .bind(filter.agent_id.as_ref().map(|a| a.as_str()))
      .bind(filter.client_id.as_ref().map(|c| c.as_str()))
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(|b| b.0).collect())
  }

  async fn history(&self, request_id: RequestId) -> StoreResult<Vec<HistoryRecord>> {
    let rows: Vec<Json<HistoryRecord>> =
      sqlx::query_scalar("SELECT body FROM assignment_history WHERE request_id = $1 ORDER BY seq")
        .bind(request_id.0)
        .fetch_all(&self.pool)
        .await?;
    Ok(rows.into_iter().map(|b| b.0).collect())
  }

  async fn commit(&self, batch: Batch) -> StoreResult<()> {
    let mut tx = self.pool.begin().await.map_err(classify)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
      .execute(&mut *tx)
      .await
      .map_err(classify)?;

    for precondition in &batch.preconditions {
      if !holds(&mut *tx, precondition).await.map_err(classify)? {
        debug!("Batch rejected: {}", precondition);
        tx.rollback().await.map_err(classify)?;
        return Err(StoreError::PreconditionFailed(precondition.clone()));
      }
    }
    for write in &batch.writes {
      apply(&mut *tx, write).await.map_err(classify)?;
    }
    tx.commit().await.map_err(|e| {
      warn!("Commit failed: {:?}", e);
      classify(e)
    })?;

    for write in batch.writes {
      let _ = self.feed.send(write);
    }
    Ok(())
  }

  fn changes(&self) -> broadcast::Receiver<Write> {
    self.feed.subscribe()
  }
}
