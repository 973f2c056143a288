use std::sync::Arc;

use standq::config::Config;
use standq::database::setup_database;
use standq::messaging::{open_event_channel, relay_changes};
use standq::routes::routes;
use standq::store::{MemoryStore, PgStore, Store};
use standq::Stand;
use tracing::{info, warn};

async fn serve<S: Store>(store: Arc<S>, config: &Config) -> anyhow::Result<()> {
  if let Some(url) = &config.rabbitmq_url {
    let channel = open_event_channel(url).await?;
    tokio::spawn(relay_changes(channel, store.changes()));
    info!("Relaying stand changes to RabbitMQ");
  }

  let stand = Stand::new(store, config.policy());
  let api = routes(stand);
  info!("Stand API listening on port {}", config.server_port);
  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();

  match &config.database_url {
    Some(url) => {
      let pool = setup_database(url).await?;
      serve(Arc::new(PgStore::new(pool)), &config).await
    }
    None => {
      warn!("DATABASE_URL not set, using the in-memory store");
      serve(Arc::new(MemoryStore::new()), &config).await
    }
  }
}
