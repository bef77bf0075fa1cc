//! # Logging Setup
//!
//! [`setup_tracing`] installs a `tracing-subscriber` formatter filtered by `RUST_LOG`.
//!
//! ```text
//! RUST_LOG=info                       lifecycle: channels created/destroyed, logins
//! RUST_LOG=channel_fabric=debug       every send/recv with channel ids
//! RUST_LOG=channel_fabric::ack=warn   just slow-response warnings
//! ```
//!
//! Fields are structured (`channel_id`, `dest`, `msg`, `error`) so they can be filtered
//! in production log pipelines.

/// Call once, early in `main`. Panics if a global subscriber is already set.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
