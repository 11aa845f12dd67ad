//! SurrealDB schema migrations and initialization

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all refactor-bot tables. Idempotent.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing refactor-bot SurrealDB schema");
    init_repo_states_table(db).await?;
    Ok(())
}

/// Initialize the `repo_states` table
///
/// Schema:
/// ```text
/// TABLE repo_states {
///   repo_id:           STRING (unique)
///   installation_id:   INT?   (indexed)
///   current_tier:      INT    (0..=2)
///   last_pr_status:    STRING? (open | merged | closed)
///   last_pr_number:    INT?
///   last_pr_url:       STRING?
///   last_pr_merged_at: DATETIME?
///   suspended_at:      DATETIME?
///   version:           INT    (compare-and-set token)
///   created_at:        DATETIME
///   updated_at:        DATETIME
/// }
/// ```
///
/// Records are never deleted; uninstalls set `suspended_at`.
async fn init_repo_states_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS repo_states
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_repo_id ON TABLE repo_states COLUMNS repo_id UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_installation_id ON TABLE repo_states COLUMNS installation_id;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    info!("✓ repo_states table initialized");
    Ok(())
}
