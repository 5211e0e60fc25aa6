//! Plain data types shared between the portcullis daemon and its tooling:
//! the JSON configuration file and the accounts file schema.

pub mod account;
pub mod config;
mod error;

pub use account::{AccountRecord, MfaRecord};
pub use config::Config;
pub use error::ConfigError;
