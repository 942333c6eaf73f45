//! Database pool initialization and global access

use once_cell::sync::OnceCell;
use sea_orm::{Database, DatabaseConnection};
use std::sync::Arc;

static DB_POOL: OnceCell<Arc<DatabaseConnection>> = OnceCell::new();

/// Connect to the database and store the pool globally.
/// Should be called once, early in application startup.
pub async fn init_db(database_url: String) {
    let pool = Database::connect(&database_url)
        .await
        .expect("Failed to connect to database.");

    DB_POOL
        .set(Arc::new(pool))
        .expect("init_db called more than once");
    log::info!("Database pool initialized.");
}

/// Get a handle to the global database pool.
///
/// Panics if `init_db` has not run yet.
pub fn get_db_pool() -> Arc<DatabaseConnection> {
    DB_POOL
        .get()
        .expect("Database pool is not initialized")
        .clone()
}
