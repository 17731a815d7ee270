//! Shared configuration and logging for the lark-bot workspace.

#![warn(clippy::all)]

pub mod config;
pub mod logging;
pub mod validation;

pub use config::{
    Config, DedupConfig, FeishuConfig, ObservabilityConfig, OpenAiConfig, RoleConfig,
    ServerConfig, SessionConfig,
};
pub use logging::{init_logging, NOISY_MODULES};
pub use validation::{Validate, ValidationError};
