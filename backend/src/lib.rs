pub mod bridge;
pub mod entities;
pub mod kv;
pub mod llm;
pub mod migrations;
pub mod storage;

pub use bridge::LlamaBridge;
pub use entities::{AppSettings, Conversation, Message, Role};
pub use llm::{LlmConfig, LlmResponse, LlmService, PerformanceMetrics, Usage};
pub use sea_orm::DbErr;
pub use storage::Storage;

use log::{debug, info};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::path::Path;

/// Opens (creating when needed) `db.sqlite` inside `dir` and runs pending migrations.
pub async fn init_db(dir: &Path) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let path = dir.join("db.sqlite");
    if !path.exists() {
        debug!("Attempting to create dir {}", dir.display());
        std::fs::create_dir_all(dir).map_err(|err| sea_orm::DbErr::Custom(err.to_string()))?;
        std::fs::File::create(&path).map_err(|err| sea_orm::DbErr::Custom(err.to_string()))?;
    };

    use sea_orm_migration::MigratorTrait;
    let filename = format!("sqlite:{}", path.display());
    let mut options = ConnectOptions::new(filename);
    options.sqlx_logging(false);
    let db = Database::connect(options).await?;
    migrations::Migrator::up(&db, None).await?;
    info!("Ran migrations");
    Ok(db)
}
