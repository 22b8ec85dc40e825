pub mod auth;
pub mod config;
pub mod crm;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod queue;
pub mod render;
pub mod repository;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils;
pub mod variables;
pub mod workers;

use anyhow::anyhow;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub use routes::create_router;
pub use workers::register_workers;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations on a pooled connection.
pub fn run_migrations(pool: &db::PgPool) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
    if !applied.is_empty() {
        tracing::info!(count = applied.len(), "applied database migrations");
    }
    Ok(())
}
