//! # Turnstile Core
//!
//! The domain layer of Turnstile: rate limiting, quotas, threat detection
//! and gateway routing.
//! This crate contains pure admission logic with zero infrastructure dependencies;
//! storage and probing come in through the traits in [`ports`].

pub mod clock;
pub mod domain;
pub mod error;
pub mod ports;
pub mod services;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BlockError, ConfigError, GatewayError, QuotaError, StoreError};
