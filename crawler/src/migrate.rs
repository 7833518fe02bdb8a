use crate::config::Config;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

/// Run catalogue migrations.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect catalogue")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate catalogue")?;

    tracing::info!("migrations complete");
    Ok(())
}
