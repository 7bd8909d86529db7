//! Webhook daemon entry point.
//!
//! Intentionally thin: tracing, settings, clients, shared state, middleware,
//! serve. Handlers live in `routes.rs`, shared state in `state.rs`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use cmw_webhook::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    cmw_config::bootstrap_env();
    init_tracing();

    let settings = cmw_config::Settings::from_env()?;
    settings.require_chat()?;
    settings.require_odata()?;

    let pool = cmw_db::connect(&settings.database_url).await?;
    cmw_db::migrate(&pool).await?;

    let chat = Arc::new(cmw_chat::ChatClient::new(
        settings.chat_api_url.clone(),
        settings.chat_account_id.clone(),
        settings.chat_api_token.clone(),
        settings.http_timeout,
    )?);
    let odata = cmw_odata::OdataClient::new(
        settings.odata_base_url.clone(),
        settings.odata_user.clone(),
        settings.odata_password.clone(),
        settings.http_timeout,
    )?;

    let bind_addr = settings.webhook_bind_addr.clone();
    let (state, background_handle) = AppState::new(pool, chat, odata, settings);

    let app = build_router(Arc::clone(&state)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!("webhook daemon listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    // Drain pending ERP write-backs before exiting. Dropping the state
    // releases the last queue sender held inside it.
    let background = state.background.clone();
    drop(state);
    background.shutdown(background_handle).await;

    Ok(())
}

fn init_tracing() {
    let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
