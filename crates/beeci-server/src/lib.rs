//! Webhook server for BeeCI.
//!
//! Receives GitHub App webhooks and turns check suite requests into
//! scheduled builds.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
