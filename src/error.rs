use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("unknown period type: {0}")]
    UnknownPeriodType(String),
    #[error("unknown normalization type: {0}")]
    UnknownNormalization(String),
    #[error("unknown control type: {0}")]
    UnknownControlType(String),
    #[error("malformed rule configuration: {0}")]
    MalformedRuleConfig(String),
    #[error("correlation configuration is empty")]
    EmptyCorrelationConfig,
}

/// Failures that end a control run. Every variant transitions the run to a
/// terminal status and is recorded in the run log.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("CONFIG_INVALID: {0}")]
    Config(#[from] ConfigError),
    #[error("CORRELATION_LIMIT_EXCEEDED: {count} candidate pairs over limit {limit}")]
    CorrelationLimitExceeded { count: i64, limit: i64 },
    #[error("INSTANCE_LIMIT_REACHED: {running} active runs of control {control} at limit {limit}")]
    InstanceLimitReached {
        control: String,
        running: i64,
        limit: i64,
    },
    #[error("PREREQUISITE_FAILED: {0}")]
    PrerequisiteFailed(String),
    #[error("TIMEOUT: statement exceeded {0} seconds")]
    Timeout(u64),
    #[error("run cancelled")]
    Cancelled,
    #[error("stabilizer did not converge within {0} iterations")]
    StabilizerDiverged(u64),
    #[error("DB_ERROR: {0}")]
    Db(#[from] sqlx::Error),
}

impl ControlError {
    /// True for the two outcomes that end a run with status `C`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}
