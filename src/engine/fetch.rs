//! Source fetchers: materialize each side of the reconciliation as a
//! windowed, filtered temporary table with a guaranteed unique key column.

use anyhow::{Context, Result, bail};

use crate::db::schema;
use crate::engine::{FetchedSource, Pipeline, Side};
use crate::models::RuleConfig;
use crate::models::SourceConfig;
use crate::sql::{Predicate, qualified};
use crate::window::ReportWindow;

/// Build the CREATE TABLE ... AS SELECT for one source.
///
/// The date field is re-projected at second resolution so window filtering
/// and time-shift math agree. When the configured key field is not a native
/// column, a row number ordered by the date field is exposed under that
/// name instead.
pub fn build_fetch_sql(
    temp_name: &str,
    side: Side,
    source: &SourceConfig,
    columns: &[String],
    key_is_native: bool,
    rules: &RuleConfig,
    window: ReportWindow,
    hint: &str,
) -> String {
    let mut select_parts: Vec<String> = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        if column == &source.date_field {
            select_parts.push(format!(
                "cast(s.`{col}` as datetime) as `{col}`",
                col = column
            ));
        } else {
            select_parts.push(format!("s.`{}`", column));
        }
    }
    if !key_is_native {
        select_parts.push(format!(
            "row_number() over (order by s.`{date}`) as `{key}`",
            date = source.date_field,
            key = source.key_field
        ));
    }

    let mut conditions: Vec<Predicate> = Vec::new();
    if let Some(filter) = &source.filter {
        conditions.push(Predicate::Raw(filter.clone()));
    }
    for rule in &rules.correlation_config {
        if rule.allow_null || rule.formula_mode {
            continue;
        }
        let field = match side {
            Side::A => &rule.field_a,
            Side::B => &rule.field_b,
        };
        conditions.push(Predicate::NotNull(qualified("s", field)));
    }
    conditions.push(Predicate::InWindow {
        field: qualified("s", &source.date_field),
        from: window.date_from,
        to: window.date_to,
    });

    format!(
        "CREATE TABLE {temp} AS\nSELECT {hint}{select}\nFROM `{src}` s\nWHERE {cond}",
        temp = temp_name,
        hint = hint,
        select = select_parts.join(", "),
        src = source.name,
        cond = Predicate::And(conditions).render()
    )
}

/// Materialize one side and index its key column.
pub async fn fetch_source(pipeline: &Pipeline<'_>, side: Side) -> Result<FetchedSource> {
    let source = pipeline.source_config(side);
    let temp_name = pipeline.names().source(side);
    log::info!("{} Fetching {}...", pipeline.tag(), source.name);

    schema::validate_ident(&source.name)?;
    schema::validate_ident(&source.date_field)?;
    schema::validate_ident(&source.key_field)?;

    let source_columns = schema::get_table_columns(pipeline.pool(), &source.name).await?;
    if !source_columns.contains(&source.date_field) {
        bail!(
            "Source {} has no date field {}",
            source.name,
            source.date_field
        );
    }
    let key_is_native = source_columns.contains(&source.key_field);
    if !key_is_native {
        // Views carry no row identity to synthesize from.
        if schema::is_view(pipeline.pool(), &source.name).await? {
            bail!(
                "Source {} is a view; key field {} must be a real unique column",
                source.name,
                source.key_field
            );
        }
        log::debug!(
            "{} Key field {} is not native to {}; synthesizing row identity",
            pipeline.tag(),
            source.key_field,
            source.name
        );
    }

    let sql = build_fetch_sql(
        &temp_name,
        side,
        source,
        &source_columns,
        key_is_native,
        pipeline.rules(),
        pipeline.window(),
        &pipeline.parallel_hint(),
    );
    pipeline
        .execute(&sql)
        .await
        .with_context(|| format!("Failed to materialize {}", temp_name))?;

    schema::create_index(pipeline.pool(), &temp_name, &source.key_field).await?;
    let rows = schema::count_rows(pipeline.pool(), &temp_name).await?;
    log::info!(
        "{} {} created with {} records",
        pipeline.tag(),
        temp_name,
        rows
    );

    let mut columns = source_columns;
    if !key_is_native {
        columns.push(source.key_field.clone());
    }
    Ok(FetchedSource { rows, columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutputColumns;
    use chrono::NaiveDateTime;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn window() -> ReportWindow {
        ReportWindow::new(dt("2024-03-01 00:00:00"), dt("2024-03-02 00:00:00")).unwrap()
    }

    fn source() -> SourceConfig {
        SourceConfig {
            name: "cdr_switch".into(),
            date_field: "call_date".into(),
            key_field: "call_id".into(),
            filter: Some("duration > 0".into()),
            output_columns: OutputColumns::default(),
        }
    }

    fn rules() -> RuleConfig {
        RuleConfig::parse(
            r#"{"correlation_config": [{"field_a": "msisdn", "field_b": "subscriber"}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_fetch_sql_native_key() {
        let columns = vec!["call_id".into(), "msisdn".into(), "call_date".into()];
        let sql = build_fetch_sql(
            "rapo_temp_source_a_7",
            Side::A,
            &source(),
            &columns,
            true,
            &rules(),
            window(),
            "",
        );
        assert!(sql.starts_with("CREATE TABLE rapo_temp_source_a_7 AS"));
        assert!(sql.contains("cast(s.`call_date` as datetime) as `call_date`"));
        assert!(sql.contains("s.`call_id`, s.`msisdn`"));
        assert!(!sql.contains("row_number"));
        assert!(sql.contains("((duration > 0))"));
        assert!(sql.contains("s.`msisdn` is not null"));
        assert!(sql.contains("s.`call_date` >= '2024-03-01 00:00:00'"));
        assert!(sql.contains("s.`call_date` < '2024-03-02 00:00:00'"));
    }

    #[test]
    fn test_fetch_sql_uses_side_b_fields() {
        let columns = vec!["call_id".into(), "subscriber".into(), "call_date".into()];
        let sql = build_fetch_sql(
            "rapo_temp_source_b_7",
            Side::B,
            &source(),
            &columns,
            true,
            &rules(),
            window(),
            "",
        );
        assert!(sql.contains("s.`subscriber` is not null"));
        assert!(!sql.contains("s.`msisdn` is not null"));
    }

    #[test]
    fn test_fetch_sql_synthesizes_key() {
        let columns = vec!["msisdn".into(), "call_date".into()];
        let sql = build_fetch_sql(
            "rapo_temp_source_b_7",
            Side::A,
            &source(),
            &columns,
            false,
            &rules(),
            window(),
            "",
        );
        assert!(sql.contains("row_number() over (order by s.`call_date`) as `call_id`"));
    }

    #[test]
    fn test_fetch_sql_respects_allow_null() {
        let rules = RuleConfig::parse(
            r#"{"correlation_config": [
                {"field_a": "msisdn", "field_b": "msisdn", "allow_null": true}
            ]}"#,
        )
        .unwrap();
        let columns = vec!["call_id".into(), "msisdn".into(), "call_date".into()];
        let sql = build_fetch_sql(
            "rapo_temp_source_a_7",
            Side::A,
            &source(),
            &columns,
            true,
            &rules,
            window(),
            "",
        );
        assert!(!sql.contains("is not null"));
    }

    #[test]
    fn test_fetch_sql_carries_parallel_hint() {
        let columns = vec!["call_id".into(), "msisdn".into(), "call_date".into()];
        let sql = build_fetch_sql(
            "rapo_temp_source_a_7",
            Side::A,
            &source(),
            &columns,
            true,
            &rules(),
            window(),
            "/*+ PARALLEL(4) */ ",
        );
        assert!(sql.contains("SELECT /*+ PARALLEL(4) */ "));
    }
}
