use std::sync::Arc;

use anyhow::Result;
use quarry_core::{serve, ServeOptions};

mod factory;
mod tables;

use factory::EnvPlugin;

/// Process entrypoint of the `env` plugin. No command-line arguments are
/// interpreted; harness settings come from the environment. `serve` blocks
/// for the process lifetime, and any error here ends the process with a
/// non-zero status for the host's supervisor to observe.
#[tokio::main]
async fn main() -> Result<()> {
    let opts = ServeOptions::from_env(Arc::new(EnvPlugin))?;
    serve(opts).await
}
