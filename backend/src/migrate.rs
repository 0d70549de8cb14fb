use sea_orm_migration::prelude::*;

#[tokio::main]
async fn main() {
    // The migration cli reads `DATABASE_URL`.
    let key = "DATABASE_URL";
    if std::env::var(key).is_err() {
        let path = std::path::Path::new("./db.sqlite");
        if !path.exists() {
            std::fs::File::create(path).expect("Create db.sqlite");
        }
        std::env::set_var(key, "sqlite:./db.sqlite");
    }
    cli::run_cli(llamachat_backend::migrations::Migrator).await;
}
