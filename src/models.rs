use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::AlgorithmDefaults;
use crate::error::ConfigError;

/// Control families from the catalogue. Only reconciliation drives the
/// matching pipeline; the other kinds are handled by external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Analysis,
    Reconciliation,
    Comparison,
    Report,
    Kpi,
}

impl ControlKind {
    pub fn parse(code: &str) -> Result<Self, ConfigError> {
        match code {
            "ANL" => Ok(Self::Analysis),
            "REC" => Ok(Self::Reconciliation),
            "CMP" => Ok(Self::Comparison),
            "REP" => Ok(Self::Report),
            "KPI" => Ok(Self::Kpi),
            other => Err(ConfigError::UnknownControlType(other.to_string())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Analysis => "ANL",
            Self::Reconciliation => "REC",
            Self::Comparison => "CMP",
            Self::Report => "REP",
            Self::Kpi => "KPI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Day,
    Week,
    Month,
}

impl PeriodType {
    pub fn parse(code: &str) -> Result<Self, ConfigError> {
        match code {
            "D" => Ok(Self::Day),
            "W" => Ok(Self::Week),
            "M" => Ok(Self::Month),
            other => Err(ConfigError::UnknownPeriodType(other.to_string())),
        }
    }
}

/// Run lifecycle. `Added` through `Progress` are transient; the rest are
/// terminal and trigger temporary-table cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Added,
    Waiting,
    Started,
    Progress,
    Done,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Added => "A",
            Self::Waiting => "Q",
            Self::Started => "S",
            Self::Progress => "P",
            Self::Done => "D",
            Self::Error => "E",
            Self::Cancelled => "C",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// Final verdict for a single source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    Loss,
    Duplicate,
    Discrepancy,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Loss => "Loss",
            Self::Duplicate => "Duplicate",
            Self::Discrepancy => "Discrepancy",
        }
    }
}

/// Scaling applied to the numeric inputs of a discrepancy rule before the
/// delta is taken. `Default` resolves to the engine-wide setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    None,
    Default,
    Minmax,
    Rank,
    ZNorm,
}

impl Normalization {
    pub fn parse(code: &str) -> Result<Self, ConfigError> {
        match code.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "default" => Ok(Self::Default),
            "minmax" => Ok(Self::Minmax),
            "rank" => Ok(Self::Rank),
            "z_norm" => Ok(Self::ZNorm),
            other => Err(ConfigError::UnknownNormalization(other.to_string())),
        }
    }
}

/// Cap on the candidate pair count produced by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationLimit {
    Auto(bool),
    Cap(i64),
}

impl Default for CorrelationLimit {
    fn default() -> Self {
        Self::Auto(false)
    }
}

impl CorrelationLimit {
    /// Resolve to a concrete row cap given both side cardinalities.
    /// `Auto(true)` caps at `ceil(2.5 * max(|A|, |B|))`.
    pub fn resolve(&self, fetched_a: i64, fetched_b: i64) -> Option<i64> {
        match self {
            Self::Auto(false) => None,
            Self::Auto(true) => {
                let base = fetched_a.max(fetched_b).max(0);
                let numerator = base * 5;
                Some((numerator + 1) / 2)
            }
            Self::Cap(n) if *n > 0 => Some(*n),
            Self::Cap(_) => None,
        }
    }
}

/// One correlation key rule: equality of `field_a` and `field_b` contributes
/// to pairing. With `formula_mode` the fields are SQL expressions instead of
/// column names; with `allow_null` a NULL on both sides counts as a match
/// for this rule only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub field_a: String,
    pub field_b: String,
    #[serde(default)]
    pub allow_null: bool,
    #[serde(default)]
    pub formula_mode: bool,
}

/// One discrepancy determinant: the numeric difference of a field pair
/// measured against `[numeric_tolerance_from, numeric_tolerance_to]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscrepancyRule {
    pub field_a: String,
    pub field_b: String,
    #[serde(default)]
    pub numeric_tolerance_from: f64,
    #[serde(default)]
    pub numeric_tolerance_to: f64,
    #[serde(default)]
    pub percentage_mode: bool,
    #[serde(default)]
    pub formula_mode: bool,
    #[serde(default)]
    pub formula_alias: Option<String>,
}

impl DiscrepancyRule {
    /// Name used in discrepancy descriptions and generated column aliases.
    pub fn display_name(&self) -> &str {
        match &self.formula_alias {
            Some(alias) => alias,
            None => &self.field_a,
        }
    }
}

/// An alternative window parameterization executed after the base run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRule {
    pub iteration_id: i64,
    #[serde(default)]
    pub iteration_description: Option<String>,
    pub period_back: i64,
    pub period_number: i64,
    pub period_type: String,
    #[serde(default)]
    pub status: String,
}

impl IterationRule {
    pub fn is_active(&self) -> bool {
        self.status == "Y"
    }
}

fn default_true() -> bool {
    true
}

/// Per-control matching rules, stored as JSON in the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub need_issues_a: bool,
    #[serde(default = "default_true")]
    pub need_issues_b: bool,
    #[serde(default)]
    pub need_recons_a: bool,
    #[serde(default)]
    pub need_recons_b: bool,
    #[serde(default)]
    pub allow_duplicates: bool,
    #[serde(default)]
    pub fuzzy_optimization: Option<bool>,
    #[serde(default)]
    pub discrepancy_matching: Option<bool>,
    #[serde(default)]
    pub normalization_type: Option<Normalization>,
    #[serde(default)]
    pub time_shift_from: i64,
    #[serde(default)]
    pub time_shift_to: i64,
    #[serde(default)]
    pub time_tolerance_from: i64,
    #[serde(default)]
    pub time_tolerance_to: i64,
    #[serde(default)]
    pub correlation_limit: CorrelationLimit,
    #[serde(default)]
    pub output_limit_a: Option<i64>,
    #[serde(default)]
    pub output_limit_b: Option<i64>,
    pub correlation_config: Vec<CorrelationRule>,
    #[serde(default)]
    pub discrepancy_config: Vec<DiscrepancyRule>,
}

impl RuleConfig {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ConfigError::MalformedRuleConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.correlation_config.is_empty() {
            return Err(ConfigError::EmptyCorrelationConfig);
        }
        if self.time_shift_from > self.time_shift_to {
            return Err(ConfigError::InvalidValue {
                field: "time_shift_from",
                reason: format!(
                    "{} exceeds time_shift_to {}",
                    self.time_shift_from, self.time_shift_to
                ),
            });
        }
        if self.time_tolerance_from > self.time_tolerance_to {
            return Err(ConfigError::InvalidValue {
                field: "time_tolerance_from",
                reason: format!(
                    "{} exceeds time_tolerance_to {}",
                    self.time_tolerance_from, self.time_tolerance_to
                ),
            });
        }
        for rule in &self.discrepancy_config {
            if rule.numeric_tolerance_from > rule.numeric_tolerance_to {
                return Err(ConfigError::InvalidValue {
                    field: "numeric_tolerance_from",
                    reason: format!(
                        "{} exceeds numeric_tolerance_to {} for {}",
                        rule.numeric_tolerance_from,
                        rule.numeric_tolerance_to,
                        rule.field_a
                    ),
                });
            }
        }
        Ok(())
    }

    /// Fill unset toggles from the engine-wide defaults.
    pub fn resolved(mut self, defaults: &AlgorithmDefaults) -> Self {
        if self.fuzzy_optimization.is_none() {
            self.fuzzy_optimization = Some(defaults.fuzzy_optimization);
        }
        if self.discrepancy_matching.is_none() {
            self.discrepancy_matching = Some(defaults.discrepancy_matching);
        }
        let normalization = match self.normalization_type {
            None | Some(Normalization::Default) => defaults.normalization_type,
            Some(other) => other,
        };
        self.normalization_type = Some(normalization);
        self
    }

    pub fn fuzzy_optimization(&self) -> bool {
        self.fuzzy_optimization.unwrap_or(false)
    }

    pub fn discrepancy_matching(&self) -> bool {
        self.discrepancy_matching.unwrap_or(false)
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization_type.unwrap_or(Normalization::None)
    }
}

/// Column selection for a result table, stored as JSON in the catalogue
/// (`{"columns": ["msisdn", "amount", ...]}`). An empty selection keeps
/// every source column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputColumns {
    #[serde(default)]
    pub columns: Vec<String>,
}

impl OutputColumns {
    pub fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw {
            None => Ok(Self::default()),
            Some(text) if text.trim().is_empty() => Ok(Self::default()),
            Some(text) => serde_json::from_str(text)
                .map_err(|e| ConfigError::MalformedRuleConfig(e.to_string())),
        }
    }
}

/// One side of a reconciliation as configured in the catalogue.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub date_field: String,
    pub key_field: String,
    pub filter: Option<String>,
    pub output_columns: OutputColumns,
}

/// The catalogue row for a control, with the JSON payloads parsed.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub control_id: i64,
    pub control_name: String,
    pub kind: ControlKind,
    pub source_a: SourceConfig,
    pub source_b: SourceConfig,
    pub period_back: i64,
    pub period_number: i64,
    pub period_type: PeriodType,
    pub parallelism: u32,
    pub timeout: Option<i64>,
    pub instance_limit: i64,
    pub output_limit: Option<i64>,
    pub rule_config: RuleConfig,
    pub iteration_config: Vec<IterationRule>,
    pub preparation_sql: Option<String>,
    pub prerequisite_sql: Option<String>,
    pub need_a: bool,
    pub need_b: bool,
    pub need_hook: bool,
    pub need_prerun_hook: bool,
    pub need_postrun_hook: bool,
}

impl ControlConfig {
    pub fn output_name_a(&self) -> String {
        format!("rapo_resa_{}", self.control_name.to_lowercase())
    }

    pub fn output_name_b(&self) -> String {
        format!("rapo_resb_{}", self.control_name.to_lowercase())
    }
}

/// Row counters reported into the run log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub fetched_a: i64,
    pub fetched_b: i64,
    pub success_a: Option<i64>,
    pub success_b: Option<i64>,
    pub error_a: Option<i64>,
    pub error_b: Option<i64>,
}

impl RunTotals {
    pub fn error_level_a(&self) -> Option<f64> {
        error_level(self.error_a, self.fetched_a)
    }

    pub fn error_level_b(&self) -> Option<f64> {
        error_level(self.error_b, self.fetched_b)
    }
}

fn error_level(errors: Option<i64>, fetched: i64) -> Option<f64> {
    match errors {
        Some(e) if fetched > 0 => Some(e as f64 / fetched as f64 * 100.0),
        _ => None,
    }
}

/// A run log record as read back from the database.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub process_id: i64,
    pub control_id: i64,
    pub status: String,
    pub date_from: Option<NaiveDateTime>,
    pub date_to: Option<NaiveDateTime>,
    pub fetched_number_a: Option<i64>,
    pub fetched_number_b: Option<i64>,
    pub success_number_a: Option<i64>,
    pub success_number_b: Option<i64>,
    pub error_number_a: Option<i64>,
    pub error_number_b: Option<i64>,
    pub prerequisite_value: Option<i64>,
    pub text_error: Option<String>,
    pub text_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_RULES: &str = r#"{
        "correlation_config": [{"field_a": "msisdn", "field_b": "subscriber"}]
    }"#;

    #[test]
    fn test_rule_config_defaults() {
        let rules = RuleConfig::parse(MINIMAL_RULES).unwrap();
        assert!(rules.need_issues_a);
        assert!(!rules.need_recons_a);
        assert!(!rules.allow_duplicates);
        assert_eq!(rules.time_shift_from, 0);
        assert_eq!(rules.correlation_limit, CorrelationLimit::Auto(false));
        assert!(rules.discrepancy_config.is_empty());
    }

    #[test]
    fn test_rule_config_rejects_empty_correlation() {
        let err = RuleConfig::parse(r#"{"correlation_config": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCorrelationConfig));
    }

    #[test]
    fn test_rule_config_rejects_inverted_envelope() {
        let raw = r#"{
            "time_shift_from": 10, "time_shift_to": -10,
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        assert!(RuleConfig::parse(raw).is_err());
    }

    #[test]
    fn test_correlation_limit_variants() {
        let raw = r#"{
            "correlation_limit": true,
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        let rules = RuleConfig::parse(raw).unwrap();
        assert_eq!(rules.correlation_limit, CorrelationLimit::Auto(true));
        assert_eq!(rules.correlation_limit.resolve(1000, 400), Some(2500));

        let raw = r#"{
            "correlation_limit": 777,
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        let rules = RuleConfig::parse(raw).unwrap();
        assert_eq!(rules.correlation_limit.resolve(10, 10), Some(777));

        assert_eq!(CorrelationLimit::Auto(false).resolve(10, 10), None);
        // odd max rounds up
        assert_eq!(CorrelationLimit::Auto(true).resolve(0, 3), Some(8));
    }

    #[test]
    fn test_normalization_resolution() {
        let defaults = AlgorithmDefaults {
            fuzzy_optimization: true,
            normalization_type: Normalization::Minmax,
            discrepancy_matching: false,
        };
        let rules = RuleConfig::parse(MINIMAL_RULES).unwrap().resolved(&defaults);
        assert!(rules.fuzzy_optimization());
        assert!(!rules.discrepancy_matching());
        assert_eq!(rules.normalization(), Normalization::Minmax);

        let raw = r#"{
            "normalization_type": "z_norm",
            "fuzzy_optimization": false,
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        let rules = RuleConfig::parse(raw).unwrap().resolved(&defaults);
        assert!(!rules.fuzzy_optimization());
        assert_eq!(rules.normalization(), Normalization::ZNorm);
    }

    #[test]
    fn test_iteration_rule_status() {
        let raw = r#"[
            {"iteration_id": 1, "period_back": 2, "period_number": 1,
             "period_type": "D", "status": "Y"},
            {"iteration_id": 2, "period_back": 7, "period_number": 7,
             "period_type": "D", "status": "N"}
        ]"#;
        let rules: Vec<IterationRule> = serde_json::from_str(raw).unwrap();
        assert!(rules[0].is_active());
        assert!(!rules[1].is_active());
    }

    #[test]
    fn test_output_columns_parse() {
        let cols = OutputColumns::parse(Some(r#"{"columns": ["msisdn", "amount"]}"#)).unwrap();
        assert_eq!(cols.columns, vec!["msisdn", "amount"]);
        assert!(OutputColumns::parse(None).unwrap().columns.is_empty());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RunStatus::Waiting.code(), "Q");
        assert!(RunStatus::Done.is_terminal());
        assert!(!RunStatus::Progress.is_terminal());
    }

    #[test]
    fn test_discrepancy_display_name() {
        let rule = DiscrepancyRule {
            field_a: "a.amount - a.fee".into(),
            field_b: "b.amount".into(),
            numeric_tolerance_from: 0.0,
            numeric_tolerance_to: 0.0,
            percentage_mode: false,
            formula_mode: true,
            formula_alias: Some("net_amount".into()),
        };
        assert_eq!(rule.display_name(), "net_amount");
    }
}
