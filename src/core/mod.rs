//! Core module - common types, configuration and error handling

pub mod config;
pub mod error;
pub mod types;

pub use config::{CurrencyConfig, CurrencyData, CurrencyKeys, CurrencyState};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
