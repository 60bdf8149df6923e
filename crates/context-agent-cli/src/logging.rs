//! Tracing subscriber setup.
//!
//! Logs go to stderr so stdout carries only command output. `RUST_LOG`
//! takes precedence over the configured level.
//!
//! The configured level is only known once the config is loaded, so loading
//! itself runs under a temporary subscriber (see [`bootstrap`]).

use context_agent::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Level used before the configuration has been read.
const BOOTSTRAP_LEVEL: &str = "info";

pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("warning: logging already initialized: {e}");
    }
}

/// Run `f` with a stderr text subscriber installed for the current thread.
///
/// Used around config loading so warnings about ignored environment values
/// or incomplete persistence settings are not lost.
pub fn bootstrap<T>(f: impl FnOnce() -> T) -> T {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(BOOTSTRAP_LEVEL));
    with_scoped(filter, std::io::stderr, f)
}

fn with_scoped<W, T>(filter: EnvFilter, writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer));
    tracing::subscriber::with_default(subscriber, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_agent::config::AgentConfig;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn config_warnings_reach_the_scoped_subscriber() {
        let captured = Captured::default();
        let writer = captured.clone();

        let config = with_scoped(
            EnvFilter::new(BOOTSTRAP_LEVEL),
            move || writer.clone(),
            || {
                let mut config = AgentConfig::default();
                config.apply_overrides_from(|key| match key {
                    "CONTEXT_AGENT_POLLING_INTERVAL" => Some("abc".to_string()),
                    "CONTEXT_AGENT_ENABLE_PERSISTENCE" => Some("true".to_string()),
                    _ => None,
                });
                config.validate().map(|()| config)
            },
        )
        .unwrap();

        assert!(config.persistence.enabled);
        let logs = captured.text();
        assert!(logs.contains("Ignoring CONTEXT_AGENT_POLLING_INTERVAL=abc"), "{logs}");
        assert!(logs.contains("configuration is incomplete"), "{logs}");
    }

    #[test]
    fn scoped_subscriber_respects_its_filter() {
        let captured = Captured::default();
        let writer = captured.clone();
        with_scoped(EnvFilter::new("error"), move || writer.clone(), || {
            tracing::warn!("filtered out");
        });
        assert!(captured.text().is_empty());
    }
}
