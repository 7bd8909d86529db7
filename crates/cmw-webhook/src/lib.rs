//! Webhook reconciler: chat events into the store, with background ERP
//! write-backs.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! and owns the listener. Handlers are `pub(crate)` so scenario tests can
//! compose the router directly.

pub mod routes;
pub mod signature;
pub mod state;
pub mod tasks;

pub use routes::{build_router, closure_refused};
pub use signature::verify_signature;
pub use state::AppState;
pub use tasks::{BackgroundTasks, ErpWrite};
