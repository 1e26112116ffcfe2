use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    // Configuration errors
    #[error("Failed to load config file '{path}': {source}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {message}")]
    ConfigValidation { message: String },

    // Audit log errors
    #[error("Failed to open audit log '{path}': {source}")]
    AuditLog {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Discord errors
    #[error("Discord API error: {message}")]
    Discord { message: String },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        BotError::Discord {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

use poise::serenity_prelude as serenity;
