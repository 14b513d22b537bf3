//! Access to the shared control catalogue (`rapo_config`) and run log
//! (`rapo_log`). Both tables are owned by external tooling; every write here
//! is a single small statement so concurrent controls never hold state
//! across stages.

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime};
use sqlx::{MySqlPool, Row, mysql::MySqlRow};

use crate::models::{
    ControlConfig, ControlKind, IterationRule, OutputColumns, PeriodType, RuleConfig, RunRecord,
    RunStatus, RunTotals, SourceConfig,
};

pub const CONFIG_TABLE: &str = "rapo_config";
pub const LOG_TABLE: &str = "rapo_log";

fn yes(row: &MySqlRow, column: &str) -> bool {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .map(|v| v == "Y")
        .unwrap_or(false)
}

fn opt_text(row: &MySqlRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .filter(|v| !v.trim().is_empty())
}

/// Load and parse the catalogue row for a control.
pub async fn read_control_config(pool: &MySqlPool, name: &str) -> Result<ControlConfig> {
    let sql = format!(
        "SELECT * FROM {} WHERE LOWER(control_name) = LOWER(?)",
        CONFIG_TABLE
    );
    let row = sqlx::query(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to read catalogue row for control {}", name))?;
    let Some(row) = row else {
        bail!("Control {} is not present in {}", name, CONFIG_TABLE);
    };
    parse_control_row(&row)
}

fn parse_control_row(row: &MySqlRow) -> Result<ControlConfig> {
    let control_name: String = row.try_get("control_name")?;
    let kind_code: String = row.try_get("control_type")?;
    let kind = ControlKind::parse(&kind_code)?;

    let rule_raw: String = row
        .try_get::<Option<String>, _>("rule_config")?
        .unwrap_or_default();
    let rule_config = RuleConfig::parse(&rule_raw)
        .with_context(|| format!("Control {} carries a malformed rule_config", control_name))?;

    let iteration_config: Vec<IterationRule> = match opt_text(row, "iteration_config") {
        Some(raw) => serde_json::from_str(&raw).with_context(|| {
            format!(
                "Control {} carries a malformed iteration_config",
                control_name
            )
        })?,
        None => Vec::new(),
    };

    let period_code: String = row.try_get("period_type")?;

    let source_a = SourceConfig {
        name: row
            .try_get::<String, _>("source_name_a")
            .map(|s| s.to_lowercase())?,
        date_field: row
            .try_get::<String, _>("source_date_field_a")
            .map(|s| s.to_lowercase())?,
        key_field: row
            .try_get::<String, _>("source_key_field_a")
            .map(|s| s.to_lowercase())?,
        filter: opt_text(row, "source_filter_a"),
        output_columns: OutputColumns::parse(opt_text(row, "output_table_a").as_deref())?,
    };
    let source_b = SourceConfig {
        name: row
            .try_get::<String, _>("source_name_b")
            .map(|s| s.to_lowercase())?,
        date_field: row
            .try_get::<String, _>("source_date_field_b")
            .map(|s| s.to_lowercase())?,
        key_field: row
            .try_get::<String, _>("source_key_field_b")
            .map(|s| s.to_lowercase())?,
        filter: opt_text(row, "source_filter_b"),
        output_columns: OutputColumns::parse(opt_text(row, "output_table_b").as_deref())?,
    };

    Ok(ControlConfig {
        control_id: row.try_get("control_id")?,
        control_name,
        kind,
        source_a,
        source_b,
        period_back: row.try_get("period_back")?,
        period_number: row.try_get("period_number")?,
        period_type: PeriodType::parse(&period_code)?,
        parallelism: row
            .try_get::<Option<i64>, _>("parallelism")?
            .map(|v| v.max(1) as u32)
            .unwrap_or(1),
        timeout: row.try_get::<Option<i64>, _>("timeout")?.filter(|v| *v > 0),
        instance_limit: row
            .try_get::<Option<i64>, _>("instance_limit")?
            .filter(|v| *v > 0)
            .unwrap_or(1),
        output_limit: row
            .try_get::<Option<i64>, _>("output_limit")?
            .filter(|v| *v > 0),
        rule_config,
        iteration_config,
        preparation_sql: opt_text(row, "preparation_sql"),
        prerequisite_sql: opt_text(row, "prerequisite_sql"),
        need_a: yes(row, "need_a"),
        need_b: yes(row, "need_b"),
        need_hook: yes(row, "need_hook"),
        need_prerun_hook: yes(row, "need_prerun_hook"),
        need_postrun_hook: yes(row, "need_postrun_hook"),
    })
}

/// Insert a new run record and return its `process_id`.
pub async fn insert_run(
    pool: &MySqlPool,
    control_id: i64,
    date_from: NaiveDateTime,
    date_to: NaiveDateTime,
) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {} (control_id, added, status, date_from, date_to)
         VALUES (?, ?, ?, ?, ?)",
        LOG_TABLE
    );
    let result = sqlx::query(&sql)
        .bind(control_id)
        .bind(Local::now().naive_local())
        .bind(RunStatus::Added.code())
        .bind(date_from)
        .bind(date_to)
        .execute(pool)
        .await
        .context("Failed to insert run log record")?;
    Ok(result.last_insert_id() as i64)
}

pub async fn update_status(pool: &MySqlPool, process_id: i64, status: RunStatus) -> Result<()> {
    let now = Local::now().naive_local();
    let sql = match status {
        RunStatus::Started => format!(
            "UPDATE {} SET status = ?, updated = ?, start_date = ? WHERE process_id = ?",
            LOG_TABLE
        ),
        s if s.is_terminal() => format!(
            "UPDATE {} SET status = ?, updated = ?, end_date = ? WHERE process_id = ?",
            LOG_TABLE
        ),
        _ => format!(
            "UPDATE {} SET status = ?, updated = ? WHERE process_id = ?",
            LOG_TABLE
        ),
    };
    let mut query = sqlx::query(&sql).bind(status.code()).bind(now);
    if matches!(status, RunStatus::Started) || status.is_terminal() {
        query = query.bind(now);
    }
    query
        .bind(process_id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to set run {} to status {}", process_id, status.code()))?;
    log::info!("[{}] Status changed to {}", process_id, status.code());
    Ok(())
}

pub async fn save_fetched(pool: &MySqlPool, process_id: i64, totals: &RunTotals) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET fetched_number_a = ?, fetched_number_b = ?, updated = ?
         WHERE process_id = ?",
        LOG_TABLE
    );
    sqlx::query(&sql)
        .bind(totals.fetched_a)
        .bind(totals.fetched_b)
        .bind(Local::now().naive_local())
        .bind(process_id)
        .execute(pool)
        .await
        .context("Failed to save fetched counters")?;
    Ok(())
}

pub async fn save_outcome(pool: &MySqlPool, process_id: i64, totals: &RunTotals) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET success_number_a = ?, success_number_b = ?,
                error_number_a = ?, error_number_b = ?,
                error_level_a = ?, error_level_b = ?, updated = ?
         WHERE process_id = ?",
        LOG_TABLE
    );
    sqlx::query(&sql)
        .bind(totals.success_a)
        .bind(totals.success_b)
        .bind(totals.error_a)
        .bind(totals.error_b)
        .bind(totals.error_level_a())
        .bind(totals.error_level_b())
        .bind(Local::now().naive_local())
        .bind(process_id)
        .execute(pool)
        .await
        .context("Failed to save outcome counters")?;
    Ok(())
}

pub async fn save_prerequisite_value(
    pool: &MySqlPool,
    process_id: i64,
    value: Option<i64>,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET prerequisite_value = ?, updated = ? WHERE process_id = ?",
        LOG_TABLE
    );
    sqlx::query(&sql)
        .bind(value)
        .bind(Local::now().naive_local())
        .bind(process_id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to save prerequisite value for run {}", process_id))?;
    Ok(())
}

pub async fn save_text_message(pool: &MySqlPool, process_id: i64, message: &str) -> Result<()> {
    update_text_column(pool, process_id, "text_message", Some(message.to_string())).await
}

pub async fn save_text_error(pool: &MySqlPool, process_id: i64, error: &str) -> Result<()> {
    update_text_column(pool, process_id, "text_error", Some(error.to_string())).await
}

async fn update_text_column(
    pool: &MySqlPool,
    process_id: i64,
    column: &str,
    value: Option<String>,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET {} = ?, updated = ? WHERE process_id = ?",
        LOG_TABLE, column
    );
    sqlx::query(&sql)
        .bind(value)
        .bind(Local::now().naive_local())
        .bind(process_id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to update {} for run {}", column, process_id))?;
    Ok(())
}

/// Read one run log record back.
pub async fn read_run(pool: &MySqlPool, process_id: i64) -> Result<RunRecord> {
    let sql = format!("SELECT * FROM {} WHERE process_id = ?", LOG_TABLE);
    let row = sqlx::query(&sql)
        .bind(process_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to read run log record {}", process_id))?;
    let Some(row) = row else {
        bail!("Run {} is not present in {}", process_id, LOG_TABLE);
    };
    Ok(RunRecord {
        process_id: row.try_get("process_id")?,
        control_id: row.try_get("control_id")?,
        status: row.try_get("status")?,
        date_from: row.try_get("date_from")?,
        date_to: row.try_get("date_to")?,
        fetched_number_a: row.try_get("fetched_number_a")?,
        fetched_number_b: row.try_get("fetched_number_b")?,
        success_number_a: row.try_get("success_number_a")?,
        success_number_b: row.try_get("success_number_b")?,
        error_number_a: row.try_get("error_number_a")?,
        error_number_b: row.try_get("error_number_b")?,
        prerequisite_value: row.try_get("prerequisite_value")?,
        text_error: row.try_get("text_error")?,
        text_message: row.try_get("text_message")?,
    })
}

/// Count runs of a control that have not reached a terminal status.
pub async fn count_active_runs(pool: &MySqlPool, control_id: i64) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) AS cnt FROM {} WHERE control_id = ? AND status IN ('A', 'Q', 'S', 'P')",
        LOG_TABLE
    );
    let row = sqlx::query(&sql)
        .bind(control_id)
        .fetch_one(pool)
        .await
        .context("Failed to count active runs")?;
    let cnt: i64 = row.try_get("cnt")?;
    Ok(cnt)
}

/// Evaluate a scalar statement such as a prerequisite check.
pub async fn fetch_scalar(pool: &MySqlPool, sql: &str) -> Result<Option<i64>> {
    let row = sqlx::query(sql)
        .fetch_optional(pool)
        .await
        .context("Failed to evaluate scalar statement")?;
    match row {
        Some(row) => Ok(row.try_get::<Option<i64>, _>(0)?),
        None => Ok(None),
    }
}

/// Call the database pre-run hook. A NULL or `OK` result lets the run
/// proceed; anything else is the abort code.
pub async fn prerun_hook(pool: &MySqlPool, process_id: i64) -> Result<Option<String>> {
    let row = sqlx::query("SELECT rapo_prerun_control_hook(?) AS code")
        .bind(process_id)
        .fetch_one(pool)
        .await
        .context("Failed to evaluate prerun hook")?;
    let code: Option<String> = row.try_get("code")?;
    match code {
        None => Ok(None),
        Some(c) if c.eq_ignore_ascii_case("OK") => Ok(None),
        Some(c) => Ok(Some(c)),
    }
}

/// Fire the database post-run hook after a terminal status.
pub async fn postrun_hook(pool: &MySqlPool, process_id: i64) -> Result<()> {
    sqlx::query("CALL rapo_postrun_control_hook(?)")
        .bind(process_id)
        .execute(pool)
        .await
        .context("Failed to execute postrun hook")?;
    Ok(())
}
