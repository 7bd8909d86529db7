//! Shared state for the webhook daemon.

use std::sync::Arc;

use sqlx::PgPool;

use cmw_chat::ChatApi;
use cmw_config::Settings;
use cmw_odata::OdataClient;

use crate::tasks::BackgroundTasks;

/// Cloneable (Arc) handle shared across all handlers. Clients are injected,
/// never rebuilt per request; the chat client sits behind the trait so tests
/// can swap in a recording fake.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub chat: Arc<dyn ChatApi>,
    pub settings: Settings,
    pub background: BackgroundTasks,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        chat: Arc<dyn ChatApi>,
        odata: OdataClient,
        settings: Settings,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (background, handle) = BackgroundTasks::spawn(pool.clone(), odata);
        (
            Arc::new(AppState {
                pool,
                chat,
                settings,
                background,
            }),
            handle,
        )
    }
}
