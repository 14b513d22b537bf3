//! Classifier: turns the organizer and resolver state into one verdict per
//! source record and materializes the per-side error and stage relations.

use anyhow::{Context, Result};

use crate::engine::{FetchedSource, Pipeline, Side, TempNames};
use crate::models::{ControlConfig, DiscrepancyRule, ResultKind, RuleConfig, SourceConfig};
use crate::sql::Predicate;

struct SideColumns {
    self_id: &'static str,
    partner_id: &'static str,
}

fn side_columns(side: Side) -> SideColumns {
    match side {
        Side::A => SideColumns {
            self_id: "a_id",
            partner_id: "b_id",
        },
        Side::B => SideColumns {
            self_id: "b_id",
            partner_id: "a_id",
        },
    }
}

fn rule_display_name(rule: &DiscrepancyRule, side: Side) -> String {
    if let Some(alias) = &rule.formula_alias {
        return alias.clone();
    }
    match side {
        Side::A => rule.field_a.clone(),
        Side::B => rule.field_b.clone(),
    }
}

/// Columns projected into the result relations: the configured output
/// selection when present, otherwise every fetched column. The key and
/// date columns are always kept so ordering and saving stay possible.
fn projection_columns(source_cfg: &SourceConfig, fetched: &FetchedSource) -> Vec<String> {
    let chosen = &source_cfg.output_columns.columns;
    if chosen.is_empty() {
        return fetched.columns.clone();
    }
    let mut columns: Vec<String> = Vec::new();
    for column in chosen {
        if fetched.columns.contains(column) {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        } else {
            log::warn!(
                "Output column {} is not present in {}; skipping",
                column,
                source_cfg.name
            );
        }
    }
    for required in [&source_cfg.key_field, &source_cfg.date_field] {
        if !columns.contains(required) {
            columns.push(required.clone());
        }
    }
    columns
}

fn render_projection(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("s.`{}`", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Discrepancy predicate over a pair row: the time envelope or any numeric
/// tolerance is violated.
fn violation_condition(rules: &RuleConfig) -> String {
    let mut parts = vec![Predicate::Eq(
        "m.discrepancy_time_status".into(),
        "0".into(),
    )];
    for number in 1..=rules.discrepancy_config.len() {
        parts.push(Predicate::Eq(
            format!("m.discrepancy_{}_status", number),
            "0".into(),
        ));
    }
    Predicate::Or(parts).render()
}

/// Any numeric determinant violated, regardless of the time envelope.
fn numeric_violation_condition(rules: &RuleConfig) -> String {
    let parts: Vec<Predicate> = (1..=rules.discrepancy_config.len())
        .map(|n| Predicate::Eq(format!("m.discrepancy_{}_status", n), "0".into()))
        .collect();
    Predicate::Or(parts).render()
}

/// `field[delta]` fragments joined by `, `, listing every violated
/// determinant of the pair plus a time-envelope breach. Deltas are shown
/// as magnitudes so both sides describe the same pair identically.
fn description_expr(config: &ControlConfig, rules: &RuleConfig, side: Side) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (i, rule) in rules.discrepancy_config.iter().enumerate() {
        let number = i + 1;
        parts.push(format!(
            "case when m.discrepancy_{n}_status = 0 \
             then concat('{name}[', abs(m.discrepancy_{n}_value), ']') end",
            n = number,
            name = rule_display_name(rule, side),
        ));
    }
    let date_field = match side {
        Side::A => &config.source_a.date_field,
        Side::B => &config.source_b.date_field,
    };
    parts.push(format!(
        "case when m.discrepancy_time_status = 0 \
         then concat('{}[', abs(m.time_shift_value), ']') end",
        date_field
    ));
    format!("concat_ws(', ', {})", parts.join(", "))
}

/// The offending-pair lookup: resolved pairs of this side's keys that
/// violate a tolerance, best (largest deviation) first.
fn issues_cte(
    names: &TempNames,
    config: &ControlConfig,
    rules: &RuleConfig,
    side: Side,
) -> String {
    let cols = side_columns(side);
    format!(
        "issues as (\n  \
         select m.{self_id} as self_id, m.{partner_id} as partner_id,\n         \
         {description} as issue_description,\n         \
         row_number() over (partition by m.{self_id}\n                            \
         order by m.discrepancy_sum desc, m.{partner_id}) as issue_rank\n  \
         from {matched} m\n  \
         where m.correlation_indicator = 'X'\n    and ({violation})\n)",
        self_id = cols.self_id,
        partner_id = cols.partner_id,
        description = description_expr(config, rules, side),
        matched = names.matched(),
        violation = violation_condition(rules),
    )
}

/// Build the per-side error CTAS.
pub fn build_error_sql(
    names: &TempNames,
    config: &ControlConfig,
    rules: &RuleConfig,
    side: Side,
    fetched: &FetchedSource,
    hint: &str,
) -> String {
    let cols = side_columns(side);
    let source_cfg = match side {
        Side::A => &config.source_a,
        Side::B => &config.source_b,
    };
    let projection = render_projection(&projection_columns(source_cfg, fetched));
    let reclassify = rules.discrepancy_matching() && !rules.discrepancy_config.is_empty();

    let mut ctes = vec![issues_cte(names, config, rules, side)];
    let mut joins = vec![
        format!(
            "left join {org} o on o.{id} = s.`{key}`",
            org = names.org(side),
            id = cols.self_id,
            key = source_cfg.key_field
        ),
        format!(
            "left join (select * from issues where issue_rank = 1) i on i.self_id = s.`{key}`",
            key = source_cfg.key_field
        ),
    ];
    let mut branches = vec![
        "when o.correlation_indicator = 'X' and i.self_id is not null then 'Discrepancy'"
            .to_string(),
        "when o.correlation_indicator = 'X' then 'Success'".to_string(),
    ];
    if reclassify {
        ctes.push(format!(
            "numeric_issues as (\n  \
             select distinct m.{id} as self_id from {matched} m\n  \
             where {cond}\n)",
            id = cols.self_id,
            matched = names.matched(),
            cond = numeric_violation_condition(rules)
        ));
        joins.push(format!(
            "left join numeric_issues n on n.self_id = s.`{key}`",
            key = source_cfg.key_field
        ));
        branches.push(
            "when o.correlation_type in ('F', 'A', 'B', 'M') \
             and n.self_id is not null then 'Loss'"
                .to_string(),
        );
    }
    branches.push("when o.correlation_type in ('F', 'A', 'B', 'M') then 'Duplicate'".to_string());

    let mut target_types = vec![ResultKind::Loss, ResultKind::Discrepancy];
    if !rules.allow_duplicates {
        target_types.push(ResultKind::Duplicate);
    }
    let targets = target_types
        .iter()
        .map(|kind| format!("'{}'", kind.as_str()))
        .collect::<Vec<_>>()
        .join(", ");

    let output_limit = match side {
        Side::A => rules.output_limit_a.or(config.output_limit),
        Side::B => rules.output_limit_b.or(config.output_limit),
    };
    let limit_clause = match output_limit {
        Some(n) => format!("\nlimit {}", n),
        None => String::new(),
    };

    format!(
        "CREATE TABLE {error} AS\n\
         with {ctes}\n\
         select {hint}* from (\n  \
         select {projection},\n         \
         case\n           {branches}\n           else 'Loss'\n         end as rapo_result_type,\n         \
         cast(i.partner_id as char(255)) as rapo_discrepancy_id,\n         \
         i.issue_description as rapo_discrepancy_description\n  \
         from {source} s\n  {joins}\n) t\n\
         where t.rapo_result_type in ({targets})\n\
         order by t.`{date}`, t.`{key}`{limit}",
        error = names.error(side),
        ctes = ctes.join(",\n"),
        hint = hint,
        projection = projection,
        branches = branches.join("\n           "),
        source = names.source(side),
        joins = joins.join("\n  "),
        targets = targets,
        date = source_cfg.date_field,
        key = source_cfg.key_field,
        limit = limit_clause,
    )
}

/// Build the per-side stage CTAS: fully resolved records with no violated
/// tolerance on any of their resolved pairs.
pub fn build_stage_sql(
    names: &TempNames,
    config: &ControlConfig,
    rules: &RuleConfig,
    side: Side,
    fetched: &FetchedSource,
    hint: &str,
) -> String {
    let cols = side_columns(side);
    let source_cfg = match side {
        Side::A => &config.source_a,
        Side::B => &config.source_b,
    };
    let projection = render_projection(&projection_columns(source_cfg, fetched));
    format!(
        "CREATE TABLE {stage} AS\n\
         with {issues}\n\
         select {hint}{projection},\n       \
         '{success}' as rapo_result_type,\n       \
         cast(null as char(255)) as rapo_discrepancy_id,\n       \
         cast(null as char(2000)) as rapo_discrepancy_description\n\
         from {source} s\n\
         join {org} o on o.{id} = s.`{key}` and o.correlation_indicator = 'X'\n\
         left join (select * from issues where issue_rank = 1) i on i.self_id = s.`{key}`\n\
         where i.self_id is null",
        stage = names.stage(side),
        issues = issues_cte(names, config, rules, side),
        success = ResultKind::Success.as_str(),
        hint = hint,
        projection = projection,
        source = names.source(side),
        org = names.org(side),
        id = cols.self_id,
        key = source_cfg.key_field,
    )
}

/// Materialize both result relations for one side.
pub async fn classify(
    pipeline: &Pipeline<'_>,
    side: Side,
    fetched: &FetchedSource,
) -> Result<()> {
    let error_sql = build_error_sql(
        pipeline.names(),
        pipeline.config(),
        pipeline.rules(),
        side,
        fetched,
        &pipeline.parallel_hint(),
    );
    pipeline
        .execute(&error_sql)
        .await
        .with_context(|| format!("Failed to classify issues on side {}", side.letter()))?;

    let stage_sql = build_stage_sql(
        pipeline.names(),
        pipeline.config(),
        pipeline.rules(),
        side,
        fetched,
        &pipeline.parallel_hint(),
    );
    pipeline
        .execute(&stage_sql)
        .await
        .with_context(|| format!("Failed to classify matches on side {}", side.letter()))?;

    log::info!(
        "{} Side {} classified into {} and {}",
        pipeline.tag(),
        side.letter(),
        pipeline.names().error(side),
        pipeline.names().stage(side)
    );
    Ok(())
}
