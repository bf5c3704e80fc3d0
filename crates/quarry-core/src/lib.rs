pub mod cache;
pub mod dispatch;
pub mod serve;

pub use serve::{bootstrap, serve, ExitReason, Harness, HostHarness, ServeOptions};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
