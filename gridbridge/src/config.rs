//! Native runtime startup configuration.
//!
//! The only knob is a whitespace-separated option string handed to the
//! isolate as its argument vector.

use serde::{Deserialize, Serialize};

/// Environment variable holding the runtime option string.
pub const OPTIONS_ENV: &str = "GRIDBRIDGE_RUNTIME_OPTIONS";

/// Options used when the isolate is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Arguments passed to isolate creation, in order.
    #[serde(default)]
    pub options: Vec<String>,
}

impl RuntimeConfig {
    /// Split an option string on whitespace. Empty tokens are dropped.
    pub fn parse(options: &str) -> Self {
        Self {
            options: options.split_whitespace().map(String::from).collect(),
        }
    }

    /// Read options from [`OPTIONS_ENV`]. A missing variable yields no options.
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::default(),
        }
    }

    /// Append a single option.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_any_whitespace() {
        let config = RuntimeConfig::parse("  -Xmx2g\t-Dfoo=bar \n --verbose ");
        assert_eq!(config.options, vec!["-Xmx2g", "-Dfoo=bar", "--verbose"]);
    }

    #[test]
    fn parse_empty_string_has_no_options() {
        assert!(RuntimeConfig::parse("   ").options.is_empty());
    }

    #[test]
    fn with_option_appends() {
        let config = RuntimeConfig::parse("-a").with_option("-b");
        assert_eq!(config.options, vec!["-a", "-b"]);
    }

    #[test]
    fn deserializes_without_options_field() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }
}
