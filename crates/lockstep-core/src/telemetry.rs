//! Tracing setup for the `lockstep` binary.
//!
//! Lockstep's own crates log at the requested level while everything else
//! (HTTP stack, runtime) stays at `warn`. `LOCKSTEP_LOG` takes precedence
//! over `RUST_LOG`. A bootstrap runs inside a [`run_span`], so every line
//! it logs carries the run id.

use tracing::{Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Filter override read before `RUST_LOG`.
pub const ENV_LOCKSTEP_LOG: &str = "LOCKSTEP_LOG";

const LOCKSTEP_TARGETS: &[&str] = &["lockstep", "lockstep_core", "lockstep_release"];

/// Filter directives used when neither `LOCKSTEP_LOG` nor `RUST_LOG` is set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = String::from("warn");
    for target in LOCKSTEP_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOCKSTEP_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Span wrapping one lockstep run.
pub fn run_span(operation: &'static str, run_id: &Uuid) -> Span {
    tracing::info_span!("lockstep.run", operation, run_id = %run_id)
}

/// Install the global subscriber. Only the first call takes effect.
///
/// `json` writes newline-delimited JSON to stdout with the enclosing run
/// span flattened into each line; otherwise human-readable lines go to
/// stderr.
pub fn init_tracing(json: bool, level: Level) {
    let registry = tracing_subscriber::registry().with(env_filter(level));
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_directives_scope_lockstep_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,lockstep=debug,lockstep_core=debug,lockstep_release=debug"
        );
    }

    #[test]
    fn test_run_span_tags_every_line() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(move || writer.clone()),
        );
        let run_id = Uuid::new_v4();

        tracing::subscriber::with_default(subscriber, || {
            let _run = run_span("bootstrap", &run_id).entered();
            tracing::info!(batch = 0, "Processing batch");
        });

        let bytes = captured.0.lock().unwrap().clone();
        let line: serde_json::Value =
            serde_json::from_str(String::from_utf8(bytes).unwrap().trim()).unwrap();
        assert_eq!(line["span"]["name"], "lockstep.run");
        assert_eq!(line["span"]["run_id"], run_id.to_string());
        assert_eq!(line["span"]["operation"], "bootstrap");
        assert_eq!(line["fields"]["batch"], 0);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::DEBUG);
        init_tracing(true, Level::INFO);
        tracing::info!("still logging");
    }
}
