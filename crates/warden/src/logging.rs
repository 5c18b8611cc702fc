//! Subscriber setup shared by the daemon and the command-line client.
//!
//! `RUST_LOG` takes precedence. Otherwise `WARDEN_LOG` (debug, info, warn or
//! warning, error, trace) sets the level for every warden crate.
//! `LOG_FORMAT=json` switches stderr output to JSON lines.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Map a `WARDEN_LOG` value to a level, falling back to `default`.
pub fn level_from(value: Option<&str>, default: &'static str) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => default,
    }
}

fn filter_for(level: &str) -> String {
    format!(
        "warden={level},wardend={level},warden_cli={level},warden_policy_bluetooth={level}"
    )
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(default_level: &'static str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("WARDEN_LOG").ok().as_deref(), default_level);
        EnvFilter::new(filter_for(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warden_log_levels() {
        assert_eq!(level_from(None, "info"), "info");
        assert_eq!(level_from(None, "warn"), "warn");
        assert_eq!(level_from(Some("debug"), "warn"), "debug");
        assert_eq!(level_from(Some("warning"), "info"), "warn");
        assert_eq!(level_from(Some("error"), "info"), "error");
        assert_eq!(level_from(Some("loud"), "info"), "info");
    }

    #[test]
    fn filter_covers_every_crate() {
        insta::assert_snapshot!(
            filter_for("debug"),
            @"warden=debug,wardend=debug,warden_cli=debug,warden_policy_bluetooth=debug"
        );
    }
}
