//! Runtime environment detection.
//!
//! Provides a single source of truth for determining the runtime environment
//! (test or production) based on the `CLAWKER_ENV` environment variable.
//!
//! # Environment Variable
//!
//! Set `CLAWKER_ENV` to one of:
//! - `test` - Test mode (redirects persisted state under `tmp/` instead of
//!   the platform config directory)
//! - (anything else or unset) - Production mode

/// Runtime environment for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Test environment - redirects state under the crate's `tmp/`.
    Test,
}

impl Environment {
    /// Detect current environment from `CLAWKER_ENV`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("CLAWKER_ENV").as_deref() {
            Ok("test") => Self::Test,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience function equivalent to `Environment::current().is_test()`.
///
/// Also true under `cfg(test)` so unit tests never touch the real config
/// directory even if `CLAWKER_ENV` is unset in the test harness.
#[must_use]
pub fn is_any_test() -> bool {
    cfg!(test) || Environment::current().is_test()
}

/// Application name used for the platform config directory and PID-file
/// parent directory (e.g. `~/.config/clawker` on Linux).
pub const APP_NAME: &str = "clawker";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Test.to_string(), "test");
    }

    #[test]
    fn test_environment_is_methods() {
        assert!(Environment::Test.is_test());
        assert!(!Environment::Test.is_production());
        assert!(Environment::Production.is_production());
        assert!(!Environment::Production.is_test());
    }

    #[test]
    fn test_is_any_test_true_under_cfg_test() {
        assert!(is_any_test());
    }
}
