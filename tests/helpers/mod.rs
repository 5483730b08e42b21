#![allow(dead_code)]

pub mod connection_tracker;
pub mod mock_server;
pub mod tls;

/// Route test logs through `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
