//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

fn filter() -> Result<EnvFilter> {
    let directive = "rivulet=info"
        .parse()
        .map_err(|e| Error::Config(format!("Invalid log directive: {}", e)))?;
    Ok(EnvFilter::from_default_env().add_directive(directive))
}

/// Install the global subscriber. `RUST_LOG` overrides the default `rivulet=info`.
pub fn init(json: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter()?)
        .with_target(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install subscriber: {}", e)))
}

/// Install a test-writer subscriber, ignoring an already installed one
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
