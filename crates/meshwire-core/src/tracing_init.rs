//! Shared tracing/logging initialization.
//!
//! Both the coordinator and the agent set up `tracing_subscriber` the same
//! way: an env-filter (RUST_LOG wins over the config default), a fmt layer,
//! and optionally a log file instead of stderr.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not
///   set (e.g. `"meshwire_server=info"`).
/// * `log_file` -- when `Some`, log lines are appended to this file instead
///   of stderr.
pub fn init_tracing(default_filter: &str, log_file: Option<&Path>) -> std::io::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

/// Default filter string for a binary: `<crate>=<level>`.
pub fn default_filter(crate_name: &str, debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!("{crate_name}={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_string_formats() {
        assert_eq!(default_filter("meshwire_server", false), "meshwire_server=info");
        assert_eq!(default_filter("meshwire_agent", true), "meshwire_agent=debug");
    }
}
