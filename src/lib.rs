pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod rate_limit; // login throttling
pub mod repo;
pub mod routes;
pub mod security;
pub mod validation;

// Re-export commonly used items for tests / the binary
pub use routes::{config, AppState};
