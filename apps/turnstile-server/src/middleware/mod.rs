//! Middleware modules.

pub mod admission;
pub mod error;
pub mod operator;
pub mod principal;

pub use admission::AdmissionGate;
pub use error::{AppResult, ProxyError};
pub use operator::{Operator, OperatorGate};
pub use principal::{Principal, TrustedProxies};
