use std::time::Duration;

use anyhow::{Result, anyhow};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, error, info, warn};

use crate::store::Write;

static CONNECT_ATTEMPTS: usize = 5;
static PUBLISH_ATTEMPTS: usize = 3;
static DELAY: u64 = 100;
static MAX_DELAY: Duration = Duration::from_secs(2);
pub static EVENTS_QUEUE: &str = "stand_events";

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

fn backoff(attempts: usize) -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(DELAY).max_delay(MAX_DELAY).map(jitter).take(attempts)
}

/// Channel for the change relay: publisher confirms on, events queue declared
/// durable so changes survive a broker restart.
pub async fn open_event_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(backoff(CONNECT_ATTEMPTS), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  channel.confirm_select(ConfirmSelectOptions::default()).await?;
  channel
    .queue_declare(EVENTS_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  info!("RabbitMQ event channel ready on queue {}", EVENTS_QUEUE);
  Ok(channel)
}

/// Persistent JSON message tagged with the change kind, so consumers can route
/// without parsing the body.
fn properties_for(change: &Write) -> BasicProperties {
  BasicProperties::default()
    .with_delivery_mode(PERSISTENT)
    .with_content_type("application/json".into())
    .with_kind(change.kind().into())
}

/// Publish one change and wait for the broker to confirm it. A nack counts as
/// a failed attempt.
pub async fn publish_change(channel: &Channel, change: &Write) -> Result<()> {
  let payload = serde_json::to_vec(change)?;
  let properties = properties_for(change);
  Retry::spawn(backoff(PUBLISH_ATTEMPTS), || async {
    let confirmation = channel
      .basic_publish("", EVENTS_QUEUE, BasicPublishOptions::default(), &payload, properties.clone())
      .await?
      .await?;
    if confirmation.is_nack() {
      return Err(anyhow!("broker refused {} change", change.kind()));
    }
    Ok::<(), anyhow::Error>(())
  })
    .await
}

/// Forward every committed change to the events queue until the feed closes.
pub async fn relay_changes(channel: Channel, mut changes: broadcast::Receiver<Write>) {
  loop {
    let change = match changes.recv().await {
      Ok(change) => change,
      Err(RecvError::Lagged(missed)) => {
        warn!("Event relay fell behind, {} changes not published", missed);
        continue;
      }
      Err(RecvError::Closed) => break,
    };
    match publish_change(&channel, &change).await {
      Ok(()) => debug!("Published {} change", change.kind()),
      Err(e) => error!("Dropping {} change after retries: {:?}", change.kind(), e),
    }
  }
  info!("Event relay stopped");
}
