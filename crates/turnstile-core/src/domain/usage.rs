use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One request outcome, handed to the external usage recorder.
///
/// Write-only: admission decisions never read these back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub subject: String,
    pub api_key_id: Option<String>,
    pub ip: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}
