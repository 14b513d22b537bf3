//! Correlator: joins the two fetched sources on the correlation key rules
//! and the date-proximity envelope, computes per-pair features, clusters
//! time-shifted events and labels the matching topology of every pair.

use anyhow::{Context, Result};

use crate::db::schema;
use crate::engine::{Pipeline, Side, TempNames};
use crate::error::ControlError;
use crate::models::{ControlConfig, DiscrepancyRule, Normalization, RuleConfig, RunTotals};
use crate::sql::Predicate;

/// Render one configured field for the given row alias.
fn field_expr(alias: &str, field: &str, formula_mode: bool) -> String {
    if formula_mode {
        format!("({})", field)
    } else {
        format!("{}.`{}`", alias, field)
    }
}

/// Wrap a numeric input into its normalized form. Scaling statistics are
/// window aggregates over the whole candidate set.
fn normalized(expr: &str, normalization: Normalization) -> String {
    match normalization {
        Normalization::None | Normalization::Default => expr.to_string(),
        Normalization::Minmax => format!(
            "(({e}) - min({e}) over ()) / nullif(max({e}) over () - min({e}) over (), 0)",
            e = expr
        ),
        Normalization::Rank => format!("dense_rank() over (order by {e})", e = expr),
        Normalization::ZNorm => format!(
            "(({e}) - avg({e}) over ()) / nullif(stddev_samp({e}) over (), 0)",
            e = expr
        ),
    }
}

/// Delta of one discrepancy pair, expressed over the projected value
/// aliases of the `joined` layer.
fn delta_expr(rule: &DiscrepancyRule, number: usize) -> String {
    if rule.percentage_mode {
        format!(
            "(value_a_{n} - value_b_{n}) / nullif(value_b_{n}, 0) * 100",
            n = number
        )
    } else {
        format!("(value_a_{n} - value_b_{n})", n = number)
    }
}

/// The join predicate: every correlation rule plus the date envelope.
fn join_predicate(config: &ControlConfig, rules: &RuleConfig) -> Predicate {
    let mut parts: Vec<Predicate> = Vec::new();
    for rule in &rules.correlation_config {
        let left = field_expr("a", &rule.field_a, rule.formula_mode);
        let right = field_expr("b", &rule.field_b, rule.formula_mode);
        if rule.allow_null {
            parts.push(Predicate::NullEq(left, right));
        } else {
            parts.push(Predicate::Eq(left, right));
        }
    }
    parts.push(Predicate::Shifted {
        left: format!("a.`{}`", config.source_a.date_field),
        right: format!("b.`{}`", config.source_b.date_field),
        from_sec: rules.time_shift_from,
        to_sec: rules.time_shift_to,
    });
    Predicate::And(parts)
}

/// Concatenated correlation key with a NULL sentinel per position.
fn key_value_expr(rules: &RuleConfig) -> String {
    let parts: Vec<String> = rules
        .correlation_config
        .iter()
        .map(|rule| {
            let left = field_expr("a", &rule.field_a, rule.formula_mode);
            let right = field_expr("b", &rule.field_b, rule.formula_mode);
            format!(
                "coalesce(cast(coalesce({}, {}) as char), '~')",
                left, right
            )
        })
        .collect();
    format!("concat_ws('|', {})", parts.join(", "))
}

/// Sum of the raw numeric inputs of one side, used by the fuzzy resolver
/// for positional ordering inside a cluster.
fn numeric_sum_expr(alias: &str, rules: &RuleConfig) -> String {
    if rules.discrepancy_config.is_empty() {
        return "cast(null as decimal(20,6))".to_string();
    }
    let parts: Vec<String> = rules
        .discrepancy_config
        .iter()
        .map(|rule| {
            let field = match alias {
                "a" => field_expr("a", &rule.field_a, rule.formula_mode),
                _ => field_expr("b", &rule.field_b, rule.formula_mode),
            };
            format!("coalesce({}, 0)", field)
        })
        .collect();
    parts.join(" + ")
}

/// Time-tolerance envelope for classifying a resolved pair as shifted in
/// time. An unset tolerance falls back to the shift envelope itself, so
/// pairs the correlator accepted are not flagged by default.
pub fn effective_time_tolerance(rules: &RuleConfig) -> (i64, i64) {
    if rules.time_tolerance_from == 0 && rules.time_tolerance_to == 0 {
        (rules.time_shift_from, rules.time_shift_to)
    } else {
        (rules.time_tolerance_from, rules.time_tolerance_to)
    }
}

/// Build the candidate-pair CTAS.
pub fn build_comb_sql(
    names: &TempNames,
    config: &ControlConfig,
    rules: &RuleConfig,
    row_cap: Option<i64>,
    hint: &str,
) -> String {
    let normalization = rules.normalization();
    let mut projections: Vec<String> = vec![
        format!("a.`{}` as a_id", config.source_a.key_field),
        format!("b.`{}` as b_id", config.source_b.key_field),
        format!("{} as key_value", key_value_expr(rules)),
        format!("a.`{}` as date_value_a", config.source_a.date_field),
        format!("b.`{}` as date_value_b", config.source_b.date_field),
        format!(
            "timestampdiff(second, b.`{}`, a.`{}`) as time_shift_value",
            config.source_b.date_field, config.source_a.date_field
        ),
    ];
    for (i, rule) in rules.discrepancy_config.iter().enumerate() {
        let number = i + 1;
        let value_a = normalized(&field_expr("a", &rule.field_a, rule.formula_mode), normalization);
        let value_b = normalized(&field_expr("b", &rule.field_b, rule.formula_mode), normalization);
        projections.push(format!("{} as value_a_{}", value_a, number));
        projections.push(format!("{} as value_b_{}", value_b, number));
    }
    projections.push(format!(
        "{} as numeric_sum_a",
        numeric_sum_expr("a", rules)
    ));
    projections.push(format!(
        "{} as numeric_sum_b",
        numeric_sum_expr("b", rules)
    ));

    let limit_clause = match row_cap {
        Some(cap) => format!("\n  limit {}", cap + 1),
        None => String::new(),
    };

    let mut feature_parts: Vec<String> = Vec::new();
    for (i, rule) in rules.discrepancy_config.iter().enumerate() {
        let number = i + 1;
        let delta = delta_expr(rule, number);
        feature_parts.push(format!("{} as discrepancy_{}_value", delta, number));
        let in_tolerance = Predicate::InTolerance {
            expr: delta.clone(),
            from: rule.numeric_tolerance_from,
            to: rule.numeric_tolerance_to,
        };
        feature_parts.push(format!(
            "case when value_a_{n} <=> value_b_{n} then 1 \
             when {tolerance} then 1 else 0 end \
             as discrepancy_{n}_status",
            n = number,
            tolerance = in_tolerance.render(),
        ));
    }
    let (tolerance_from, tolerance_to) = effective_time_tolerance(rules);
    feature_parts.push(format!(
        "case when j.time_shift_value between {} and {} then 1 else 0 end \
         as discrepancy_time_status",
        tolerance_from, tolerance_to
    ));
    let sum_expr = if rules.discrepancy_config.is_empty() {
        "cast(null as decimal(20,6))".to_string()
    } else {
        rules
            .discrepancy_config
            .iter()
            .enumerate()
            .map(|(i, rule)| format!("abs({})", delta_expr(rule, i + 1)))
            .collect::<Vec<_>>()
            .join(" + ")
    };
    feature_parts.push(format!("{} as discrepancy_sum", sum_expr));

    format!(
        "CREATE TABLE {comb} AS\n\
         with joined as (\n  select {hint}{projections}\n  from {src_a} a\n  \
         join {src_b} b\n    on {join}{limit}\n),\n\
         paired as (\n  select j.*,\n    {features}\n  from joined j\n),\n\
         flagged as (\n  select p.*,\n    \
         case when lag(greatest(p.date_value_a, p.date_value_b)) over w is null then 1\n         \
         when timestampdiff(second,\n                \
         lag(greatest(p.date_value_a, p.date_value_b)) over w,\n                \
         greatest(p.date_value_a, p.date_value_b))\n              \
         between {shift_from} and {shift_to} then 0\n         \
         else 1 end as group_break\n  from paired p\n  \
         window w as (partition by p.key_value\n               \
         order by greatest(p.date_value_a, p.date_value_b), p.a_id, p.b_id)\n)\n\
         select f.*,\n  \
         sum(f.group_break) over (partition by f.key_value\n                           \
         order by greatest(f.date_value_a, f.date_value_b), f.a_id, f.b_id\n                           \
         rows unbounded preceding) as time_shift_group_number\n\
         from flagged f",
        comb = names.comb(),
        hint = hint,
        projections = projections.join(",\n    "),
        src_a = names.source(Side::A),
        src_b = names.source(Side::B),
        join = join_predicate(config, rules).render(),
        limit = limit_clause,
        features = feature_parts.join(",\n    "),
        shift_from = rules.time_shift_from,
        shift_to = rules.time_shift_to,
    )
}

/// Build the labeled pair relation on top of the candidates: totals per
/// `(key_value, time_shift_group_number)`, per-side ranks and the
/// correlation type of every pair.
pub fn build_mod_sql(names: &TempNames, hint: &str) -> String {
    format!(
        "CREATE TABLE {matched} AS\n\
         with grouped as (\n  \
         select key_value, time_shift_group_number,\n         \
         count(distinct b_id) as total_match_number_a,\n         \
         count(distinct a_id) as total_match_number_b\n  \
         from {comb}\n  group by key_value, time_shift_group_number\n)\n\
         select {hint}c.*,\n  \
         g.total_match_number_a,\n  g.total_match_number_b,\n  \
         dense_rank() over (partition by c.a_id order by abs(c.time_shift_value)) as time_shift_rank_a,\n  \
         dense_rank() over (partition by c.b_id order by abs(c.time_shift_value)) as time_shift_rank_b,\n  \
         dense_rank() over (partition by c.a_id order by c.discrepancy_sum) as discrepancy_rank_a,\n  \
         dense_rank() over (partition by c.b_id order by c.discrepancy_sum) as discrepancy_rank_b,\n  \
         row_number() over (partition by c.a_id order by c.discrepancy_sum, abs(c.time_shift_value), c.b_id) as match_position_a,\n  \
         row_number() over (partition by c.b_id order by c.discrepancy_sum, abs(c.time_shift_value), c.a_id) as match_position_b,\n  \
         case\n    \
         when g.total_match_number_a = 1 and g.total_match_number_b = 1 then 'O'\n    \
         when g.total_match_number_a = g.total_match_number_b then 'F'\n    \
         when g.total_match_number_b = 1 then 'A'\n    \
         when g.total_match_number_a = 1 then 'B'\n    \
         else 'M'\n  end as correlation_type,\n  \
         case when g.total_match_number_a = 1 and g.total_match_number_b = 1 then 'R' end as correlation_status,\n  \
         case when g.total_match_number_a = 1 and g.total_match_number_b = 1 then 'X' end as correlation_indicator\n\
         from {comb} c\n\
         join grouped g\n  on g.key_value = c.key_value\n \
         and g.time_shift_group_number = c.time_shift_group_number",
        matched = names.matched(),
        comb = names.comb(),
        hint = hint,
    )
}

/// Run the correlator stage: materialize the candidates, enforce the
/// correlation limit, then label them.
pub async fn correlate(pipeline: &Pipeline<'_>, totals: &RunTotals) -> Result<()> {
    let rules = pipeline.rules();
    let row_cap = rules
        .correlation_limit
        .resolve(totals.fetched_a, totals.fetched_b);

    let comb_sql = build_comb_sql(
        pipeline.names(),
        pipeline.config(),
        rules,
        row_cap,
        &pipeline.parallel_hint(),
    );
    pipeline
        .execute(&comb_sql)
        .await
        .context("Failed to materialize candidate pairs")?;

    let candidates = schema::count_rows(pipeline.pool(), &pipeline.names().comb()).await?;
    log::info!("{} Candidate pairs: {}", pipeline.tag(), candidates);
    if let Some(limit) = row_cap {
        if candidates > limit {
            return Err(ControlError::CorrelationLimitExceeded {
                count: candidates,
                limit,
            }
            .into());
        }
    }

    let mod_sql = build_mod_sql(pipeline.names(), &pipeline.parallel_hint());
    pipeline
        .execute(&mod_sql)
        .await
        .context("Failed to label candidate pairs")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ControlKind, OutputColumns, PeriodType, SourceConfig,
    };

    fn source(name: &str, date: &str, key: &str) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            date_field: date.into(),
            key_field: key.into(),
            filter: None,
            output_columns: OutputColumns::default(),
        }
    }

    fn config(rules: RuleConfig) -> ControlConfig {
        ControlConfig {
            control_id: 1,
            control_name: "cdr_mirror".into(),
            kind: ControlKind::Reconciliation,
            source_a: source("cdr_switch", "call_date", "call_id"),
            source_b: source("cdr_billing", "bill_date", "bill_id"),
            period_back: 1,
            period_number: 1,
            period_type: PeriodType::Day,
            parallelism: 1,
            timeout: None,
            instance_limit: 1,
            output_limit: None,
            rule_config: rules,
            iteration_config: vec![],
            preparation_sql: None,
            prerequisite_sql: None,
            need_a: true,
            need_b: true,
            need_hook: false,
            need_prerun_hook: false,
            need_postrun_hook: false,
        }
    }

    fn rules(raw: &str) -> RuleConfig {
        RuleConfig::parse(raw).unwrap()
    }

    const BASE_RULES: &str = r#"{
        "time_shift_from": -120, "time_shift_to": 120,
        "correlation_config": [{"field_a": "msisdn", "field_b": "subscriber"}],
        "discrepancy_config": [{
            "field_a": "amount", "field_b": "charged",
            "numeric_tolerance_from": -5, "numeric_tolerance_to": 5
        }]
    }"#;

    #[test]
    fn test_comb_sql_join_and_features() {
        let rules = rules(BASE_RULES);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, None, "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_comb_9 AS"));
        assert!(sql.contains("a.`msisdn` = b.`subscriber`"));
        assert!(sql.contains(
            "a.`call_date` between b.`bill_date` + interval -120 second \
             and b.`bill_date` + interval 120 second"
        ));
        assert!(sql.contains("timestampdiff(second, b.`bill_date`, a.`call_date`) as time_shift_value"));
        assert!(sql.contains("(value_a_1 - value_b_1) as discrepancy_1_value"));
        assert!(sql.contains("between -5 and 5 then 1 else 0 end as discrepancy_1_status"));
        assert!(sql.contains("abs((value_a_1 - value_b_1)) as discrepancy_sum"));
        assert!(sql.contains("partition by p.key_value"));
        assert!(sql.contains("time_shift_group_number"));
        assert!(!sql.contains("limit"));
    }

    #[test]
    fn test_comb_sql_zero_envelope_joins_on_equality() {
        let raw = r#"{
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        let rules = rules(raw);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, None, "");
        assert!(sql.contains("a.`call_date` = b.`bill_date`"));
        assert!(!sql.contains("interval"));
    }

    #[test]
    fn test_comb_sql_allow_null_is_per_rule() {
        let raw = r#"{
            "correlation_config": [
                {"field_a": "k1", "field_b": "k1", "allow_null": true},
                {"field_a": "k2", "field_b": "k2"}
            ]
        }"#;
        let rules = rules(raw);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, None, "");
        assert!(sql.contains("(a.`k1` = b.`k1` or (a.`k1` is null and b.`k1` is null))"));
        assert!(sql.contains("(a.`k2` = b.`k2`)"));
        assert!(!sql.contains("(a.`k2` = b.`k2` or"));
    }

    #[test]
    fn test_comb_sql_row_cap() {
        let rules = rules(BASE_RULES);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, Some(2500), "");
        assert!(sql.contains("limit 2501"));
    }

    #[test]
    fn test_comb_sql_percentage_mode() {
        let raw = r#"{
            "correlation_config": [{"field_a": "k", "field_b": "k"}],
            "discrepancy_config": [{
                "field_a": "amount", "field_b": "charged",
                "numeric_tolerance_from": -1, "numeric_tolerance_to": 1,
                "percentage_mode": true
            }]
        }"#;
        let rules = rules(raw);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, None, "");
        assert!(sql.contains("(value_a_1 - value_b_1) / nullif(value_b_1, 0) * 100"));
    }

    #[test]
    fn test_comb_sql_formula_mode() {
        let raw = r#"{
            "correlation_config": [{"field_a": "k", "field_b": "k"}],
            "discrepancy_config": [{
                "field_a": "a.amount - a.fee", "field_b": "b.charged",
                "formula_mode": true, "formula_alias": "net_amount"
            }]
        }"#;
        let rules = rules(raw);
        let cfg = config(rules.clone());
        let sql = build_comb_sql(&TempNames::new(9), &cfg, &rules, None, "");
        assert!(sql.contains("(a.amount - a.fee) as value_a_1"));
        assert!(sql.contains("(b.charged) as value_b_1"));
    }

    #[test]
    fn test_normalization_forms() {
        assert_eq!(normalized("a.`v`", Normalization::None), "a.`v`");
        assert!(normalized("a.`v`", Normalization::Minmax)
            .contains("min(a.`v`) over ()"));
        assert_eq!(
            normalized("a.`v`", Normalization::Rank),
            "dense_rank() over (order by a.`v`)"
        );
        assert!(normalized("a.`v`", Normalization::ZNorm).contains("stddev_samp"));
    }

    #[test]
    fn test_key_value_uses_null_sentinel() {
        let rules = rules(BASE_RULES);
        let expr = key_value_expr(&rules);
        assert_eq!(
            expr,
            "concat_ws('|', coalesce(cast(coalesce(a.`msisdn`, b.`subscriber`) as char), '~'))"
        );
    }

    #[test]
    fn test_effective_time_tolerance_defaults_to_shift_envelope() {
        let base_rules = rules(BASE_RULES);
        assert_eq!(effective_time_tolerance(&base_rules), (-120, 120));

        let raw = r#"{
            "time_shift_from": -120, "time_shift_to": 120,
            "time_tolerance_from": -10, "time_tolerance_to": 10,
            "correlation_config": [{"field_a": "k", "field_b": "k"}]
        }"#;
        assert_eq!(effective_time_tolerance(&rules(raw)), (-10, 10));
    }

    #[test]
    fn test_mod_sql_topology_labels() {
        let sql = build_mod_sql(&TempNames::new(9), "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_mod_9 AS"));
        assert!(sql.contains("count(distinct b_id) as total_match_number_a"));
        assert!(sql.contains("count(distinct a_id) as total_match_number_b"));
        assert!(sql.contains("group by key_value, time_shift_group_number"));
        assert!(sql.contains(
            "when g.total_match_number_a = 1 and g.total_match_number_b = 1 then 'O'"
        ));
        assert!(sql.contains("when g.total_match_number_a = g.total_match_number_b then 'F'"));
        assert!(sql.contains("when g.total_match_number_b = 1 then 'A'"));
        assert!(sql.contains("when g.total_match_number_a = 1 then 'B'"));
        assert!(sql.contains("else 'M'"));
        // one-to-one pairs start resolved
        assert!(sql.contains("then 'R' end as correlation_status"));
        assert!(sql.contains("then 'X' end as correlation_indicator"));
    }

    #[test]
    fn test_mod_sql_rank_columns() {
        let sql = build_mod_sql(&TempNames::new(9), "");
        for column in [
            "time_shift_rank_a",
            "time_shift_rank_b",
            "discrepancy_rank_a",
            "discrepancy_rank_b",
            "match_position_a",
            "match_position_b",
        ] {
            assert!(sql.contains(column), "missing {}", column);
        }
    }
}
