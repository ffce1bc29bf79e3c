//! Configuration types

use crate::error::{ConfigError, StrataResult};
use serde::{Deserialize, Serialize};

/// How a broker populates its identity cache on a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Fetch one row per missing key.
    #[default]
    Lazy,
    /// Load every row of the relation on the first lookup.
    Full,
}

/// Parameter placeholder convention of the backing store driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placeholder {
    /// `?`
    #[default]
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `%s`
    Format,
}

impl Placeholder {
    /// Render the placeholder for the 1-based parameter `index`.
    pub fn render(&self, index: usize) -> String {
        match self {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${}", index),
            Placeholder::Format => "%s".to_string(),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    pub load_policy: LoadPolicy,
    /// Overrides the gateway's own placeholder convention when set.
    pub placeholder: Option<Placeholder>,
    /// Data source name used by `connect_default`.
    pub source: Option<String>,
}

impl StrataConfig {
    pub fn new(load_policy: LoadPolicy) -> Self {
        Self {
            load_policy,
            ..Self::default()
        }
    }

    pub fn with_placeholder(mut self, placeholder: Placeholder) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// load_policy = "full"
    /// placeholder = "dollar"
    /// source = "orders.db"
    /// ```
    pub fn from_toml_str(text: &str) -> StrataResult<Self> {
        let config: StrataConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StrataResult<()> {
        if let Some(source) = &self.source {
            if source.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "source".to_string(),
                    value: source.clone(),
                    reason: "data source name must not be blank".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}
