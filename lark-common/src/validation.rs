//! Configuration validation for the lark-bot service.
//!
//! Structural checks run once at startup; a failed check is process-fatal
//! before anything binds or connects. Credential presence is deliberately
//! not validated here: the service degrades gracefully without credentials
//! (replies logged instead of sent, key-less compatible backends).

use thiserror::Error;

use crate::config::{
    Config, DedupConfig, ObservabilityConfig, OpenAiConfig, ServerConfig, SessionConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.validate() {
            errors.push(e);
        }
        if let Err(e) = self.openai.validate() {
            errors.push(e);
        }
        if let Err(e) = self.session.validate() {
            errors.push(e);
        }
        if let Err(e) = self.dedup.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.validate_roles() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    fn validate_roles(&self) -> ValidationResult<()> {
        for (i, role) in self.roles.iter().enumerate() {
            if role.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: format!("roles[{}].name", i),
                });
            }
            if role.prompt.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: format!("roles[{}].prompt", i),
                });
            }
        }
        Ok(())
    }

    /// Load and validate configuration.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "server.port".into(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "server.host".into(),
            });
        }
        Ok(())
    }
}

impl Validate for OpenAiConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "openai.model".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "openai.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_tokens <= 0 {
            return Err(ValidationError::InvalidValue {
                field: "openai.max_tokens".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::InvalidValue {
                field: "openai.base_backoff_ms".into(),
                reason: "must not exceed openai.max_backoff_ms".into(),
            });
        }
        Ok(())
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.default_role.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "session.default_role".into(),
            });
        }
        if self.history_window == 0 {
            return Err(ValidationError::InvalidValue {
                field: "session.history_window".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for DedupConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.retention_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "dedup.retention_secs".into(),
                reason: "must be greater than 0 (redelivery suppression depends on it)".into(),
            });
        }
        if self.max_entries == 0 {
            return Err(ValidationError::InvalidValue {
                field: "dedup.max_entries".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }
        Ok(())
    }
}
