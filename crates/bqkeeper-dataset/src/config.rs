//! Controller configuration
//!
//! Both values come from the operator's command line / environment; nothing
//! here is hard-coded into the reconciler.

use bqkeeper_common::DEFAULT_RESERVED_LABEL_PREFIX;

/// Configuration consumed by the dataset reconciler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetConfig {
    /// Identity granted OWNER on every managed dataset so the operator never
    /// locks itself out. None disables the injection.
    pub operator_principal: Option<String>,

    /// Labels starting with this prefix are excluded from the synchronization hash
    pub reserved_label_prefix: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            operator_principal: None,
            reserved_label_prefix: DEFAULT_RESERVED_LABEL_PREFIX.to_string(),
        }
    }
}

impl DatasetConfig {
    /// Create a config, treating a blank principal as unset
    pub fn new(operator_principal: Option<String>, reserved_label_prefix: impl Into<String>) -> Self {
        Self {
            operator_principal: operator_principal
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            reserved_label_prefix: reserved_label_prefix.into(),
        }
    }

    /// Set the operator principal
    pub fn with_operator_principal(mut self, principal: impl Into<String>) -> Self {
        self.operator_principal = Some(principal.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_platform_prefix() {
        let config = DatasetConfig::default();
        assert_eq!(config.reserved_label_prefix, "nais.io/");
        assert!(config.operator_principal.is_none());
    }

    #[test]
    fn blank_principal_is_unset() {
        let config = DatasetConfig::new(Some("  ".to_string()), "nais.io/");
        assert!(config.operator_principal.is_none());
    }

    #[test]
    fn principal_is_trimmed() {
        let config = DatasetConfig::new(Some(" op@x.iam.gserviceaccount.com ".to_string()), "p/");
        assert_eq!(
            config.operator_principal.as_deref(),
            Some("op@x.iam.gserviceaccount.com")
        );
        assert_eq!(config.reserved_label_prefix, "p/");
    }
}
