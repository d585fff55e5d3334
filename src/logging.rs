//! Diagnostic logging
//!
//! Progress output goes to stdout through `colored`; `tracing` carries the
//! diagnostics to stderr, filtered by `TESTLOOP_LOG`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TESTLOOP_LOG";

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "testloop=debug"
    } else {
        "testloop=info"
    }
}

/// Build the filter: `TESTLOOP_LOG` wins when set and valid.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbose: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_default_level() {
        assert_eq!(default_directive(false), "testloop=info");
        assert_eq!(default_directive(true), "testloop=debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false);
        init(true);
    }
}
