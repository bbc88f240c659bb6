use rehearsal_sync::config::HubConfig;
use rehearsal_sync::{routes, state};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = HubConfig::from_env();
    let port = config.port;
    let state = state::AppState::new(config);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "rehearsal hub listening");
    axum::serve(listener, app).await.expect("server failed");
}
