use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    IntervalPending,
    BelowThreshold,
}

/// Result of one reporter tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    WarmingUp,
    Published { value: i32 },
    PublishFailed { error: String },
    Skipped(SkipReason),
    AwaitingReconnect,
    ReconnectFailed { failures: u32, error: String },
    RestartRequested { failures: u32, error: String },
    GaveUp,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WarmingUp => "WARMING_UP",
            Self::Published { .. } => "PUBLISHED",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::Skipped(SkipReason::IntervalPending) => "INTERVAL_PENDING",
            Self::Skipped(SkipReason::BelowThreshold) => "BELOW_THRESHOLD",
            Self::AwaitingReconnect => "AWAITING_RECONNECT",
            Self::ReconnectFailed { .. } => "RECONNECT_FAILED",
            Self::RestartRequested { .. } => "RESTART_REQUESTED",
            Self::GaveUp => "GAVE_UP",
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReporterStatePayload {
    pub value: i32,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "warmingUp")]
    pub warming_up: bool,
    #[serde(rename = "lastUpdateSentMs")]
    pub last_update_sent_ms: u64,
    #[serde(rename = "lastReconnectAttemptMs")]
    pub last_reconnect_attempt_ms: u64,
    #[serde(rename = "reconnectFailures")]
    pub reconnect_failures: u32,
    #[serde(rename = "restartRequested")]
    pub restart_requested: bool,
}
