//! Worker entry point: serves the guest runtime over stdin/stdout.
//!
//! Stdout carries the protocol, so logging goes to stderr only.

use anyhow::Result;
use replbox_core::guest::{EngineCatalog, GuestRuntime};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("REPLBOX_GUEST_LOG", "warn"))
        .target(env_logger::Target::Stderr)
        .init();

    log::debug!("Guest runtime starting on stdio");
    GuestRuntime::run_stdio(Arc::new(EngineCatalog::with_builtin_engines())).await?;
    Ok(())
}
