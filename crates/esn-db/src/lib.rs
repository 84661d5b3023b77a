// crates/esn-db/src/lib.rs
//! Postgres state store for the liveness-and-release core.
//!
//! `PgStore` implements the [`StateStore`] trait with one transaction per
//! compound operation; per-user serialization comes from `SELECT … FOR
//! UPDATE` on the `polling_configs` row, taken before any dependent
//! check-in read or write.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod error;
mod pg;
mod store;

pub use error::StoreError;
pub use pg::PgStore;
pub use store::{
    CheckInConfirmation, CheckInStatusView, EscalationOutcome, ExpiredCheckIn, NewFinalLetter,
    NewTrustee, NewUser, NewVaultItem, ReleaseOutcome, StateStore, StatusCounts,
};

pub const ENV_DB_URL: &str = "ESN_DATABASE_URL";

/// Connect to Postgres using ESN_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper: connect using ESN_DATABASE_URL and ensure migrations are
/// applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='polling_configs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}
