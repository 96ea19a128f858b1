//! Tracing initialization

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Redact a secret for display. Keeps nothing but the fact a value is set.
pub fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "(unset)"
    } else {
        "***"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_never_echoes() {
        assert_eq!(redact("sk-secret"), "***");
        assert_eq!(redact(""), "(unset)");
    }
}
