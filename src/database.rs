use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
