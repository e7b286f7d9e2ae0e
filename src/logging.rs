//! Process-wide logging setup
//!
//! Used by the `gscript` binary and by every generated artifact. The
//! `GSCRIPT_LOG` environment variable takes a full `EnvFilter` directive and
//! overrides the verbosity flag.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding a filter directive
pub const ENV_FILTER_VAR: &str = "GSCRIPT_LOG";

/// Default level when `GSCRIPT_LOG` is unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only
    Quiet,
    #[default]
    Normal,
    Debug,
}

impl Verbosity {
    /// `--debug` wins over `--quiet`
    pub fn from_flags(debug: bool, quiet: bool) -> Self {
        match (debug, quiet) {
            (true, _) => Verbosity::Debug,
            (false, true) => Verbosity::Quiet,
            (false, false) => Verbosity::Normal,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_env(ENV_FILTER_VAR).unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_verbosity() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Debug);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(Verbosity::Quiet);
        init(Verbosity::Debug);
    }
}
