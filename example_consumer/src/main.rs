//! Example consumer: serves the collections declared in a model file.
//!
//! Run from repo root: `MODEL_PATH=model.json cargo run -p example-consumer`

use restgen::{load_from_path, resolve, ApiManager, ApiSettings, PgDatabase};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("restgen=info")),
        )
        .init();

    let model_path = std::env::var("MODEL_PATH").unwrap_or_else(|_| "model.json".into());
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/restgen".into());
    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());

    let model = load_from_path(&model_path).await?;
    let registry = resolve(&model)?;
    let db = PgDatabase::connect(&database_url, 5).await?;

    let mut manager = ApiManager::new(ApiSettings::from_env()?, registry, Arc::new(db));
    manager.create_apis(&model)?;
    let app = manager.router();

    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("Serving {} on http://{}", model_path, listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
