//! Result writer: appends the classified relations into the per-control
//! result tables, creating them on first use. A failed run never touches
//! previously saved data; every insert is keyed by the process id.

use anyhow::{Context, Result};

use crate::db::schema;
use crate::engine::{Pipeline, Side};

/// Counters of persisted rows per side.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOutcome {
    pub success_a: Option<i64>,
    pub success_b: Option<i64>,
    pub error_a: Option<i64>,
    pub error_b: Option<i64>,
}

/// Create the result table from the shape of the error relation when it
/// does not exist yet, with the process-id column appended and indexed.
pub fn build_create_output_sql(output_name: &str, template_table: &str) -> String {
    format!(
        "CREATE TABLE {output} AS\n\
         SELECT e.*, CAST(NULL AS SIGNED) AS rapo_process_id\n\
         FROM {template} e\nWHERE 1 = 0",
        output = output_name,
        template = template_table,
    )
}

pub fn build_output_index_sql(output_name: &str) -> String {
    format!(
        "CREATE INDEX {output}_rapo_process_id_ix ON {output} (rapo_process_id)",
        output = output_name,
    )
}

/// Append one classified relation into the result table. Columns are the
/// intersection of both relations so older result tables with narrower
/// shapes keep working; the process id is appended last.
pub fn build_insert_sql(
    output_name: &str,
    input_table: &str,
    output_columns: &[String],
    input_columns: &[String],
    process_id: i64,
) -> String {
    let shared: Vec<&String> = output_columns
        .iter()
        .filter(|c| c.as_str() != "rapo_process_id" && input_columns.contains(c))
        .collect();
    let target_list: Vec<String> = shared
        .iter()
        .map(|c| format!("`{}`", c))
        .chain(std::iter::once("`rapo_process_id`".to_string()))
        .collect();
    let select_list: Vec<String> = shared
        .iter()
        .map(|c| format!("t.`{}`", c))
        .chain(std::iter::once(process_id.to_string()))
        .collect();
    format!(
        "INSERT INTO {output} ({targets})\nSELECT {selects}\nFROM {input} t",
        output = output_name,
        targets = target_list.join(", "),
        selects = select_list.join(", "),
        input = input_table,
    )
}

async fn ensure_output_table(
    pipeline: &Pipeline<'_>,
    output_name: &str,
    template_table: &str,
) -> Result<()> {
    if schema::table_exists(pipeline.pool(), output_name).await? {
        return Ok(());
    }
    log::info!("{} Creating result table {}", pipeline.tag(), output_name);
    pipeline
        .execute(&build_create_output_sql(output_name, template_table))
        .await
        .with_context(|| format!("Failed to create result table {}", output_name))?;
    pipeline
        .execute(&build_output_index_sql(output_name))
        .await
        .with_context(|| format!("Failed to index result table {}", output_name))?;
    Ok(())
}

async fn persist_side(
    pipeline: &Pipeline<'_>,
    side: Side,
) -> Result<(Option<i64>, Option<i64>)> {
    let config = pipeline.config();
    let rules = pipeline.rules();
    let (needed, need_issues, need_recons, output_name) = match side {
        Side::A => (
            config.need_a,
            rules.need_issues_a,
            rules.need_recons_a,
            config.output_name_a(),
        ),
        Side::B => (
            config.need_b,
            rules.need_issues_b,
            rules.need_recons_b,
            config.output_name_b(),
        ),
    };
    if !needed {
        log::debug!(
            "{} Side {} output not requested; skipping save",
            pipeline.tag(),
            side.letter()
        );
        return Ok((None, None));
    }

    let error_table = pipeline.names().error(side);
    let stage_table = pipeline.names().stage(side);
    ensure_output_table(pipeline, &output_name, &error_table).await?;
    let output_columns = schema::get_table_columns(pipeline.pool(), &output_name).await?;

    let mut error_count = None;
    if need_issues {
        let input_columns = schema::get_table_columns(pipeline.pool(), &error_table).await?;
        let inserted = pipeline
            .execute(&build_insert_sql(
                &output_name,
                &error_table,
                &output_columns,
                &input_columns,
                pipeline.process_id(),
            ))
            .await
            .with_context(|| format!("Failed to save issues into {}", output_name))?;
        error_count = Some(inserted as i64);
    }
    let mut success_count = None;
    if need_recons {
        let input_columns = schema::get_table_columns(pipeline.pool(), &stage_table).await?;
        let inserted = pipeline
            .execute(&build_insert_sql(
                &output_name,
                &stage_table,
                &output_columns,
                &input_columns,
                pipeline.process_id(),
            ))
            .await
            .with_context(|| format!("Failed to save matches into {}", output_name))?;
        success_count = Some(inserted as i64);
    }
    log::info!(
        "{} Side {} saved: issues={:?}, matches={:?}",
        pipeline.tag(),
        side.letter(),
        error_count,
        success_count
    );
    Ok((success_count, error_count))
}

/// Persist both sides and report row counters.
pub async fn persist(pipeline: &Pipeline<'_>) -> Result<SaveOutcome> {
    let (success_a, error_a) = persist_side(pipeline, Side::A).await?;
    let (success_b, error_b) = persist_side(pipeline, Side::B).await?;
    Ok(SaveOutcome {
        success_a,
        success_b,
        error_a,
        error_b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_output_copies_shape_without_rows() {
        let sql = build_create_output_sql("rapo_resa_cdr_mirror", "rapo_temp_error_a_4");
        assert!(sql.contains("CREATE TABLE rapo_resa_cdr_mirror AS"));
        assert!(sql.contains("CAST(NULL AS SIGNED) AS rapo_process_id"));
        assert!(sql.contains("WHERE 1 = 0"));
    }

    #[test]
    fn test_output_index_on_process_id() {
        let sql = build_output_index_sql("rapo_resb_cdr_mirror");
        assert_eq!(
            sql,
            "CREATE INDEX rapo_resb_cdr_mirror_rapo_process_id_ix \
             ON rapo_resb_cdr_mirror (rapo_process_id)"
        );
    }

    #[test]
    fn test_insert_intersects_columns_and_appends_process_id() {
        let output = vec![
            "call_id".to_string(),
            "amount".to_string(),
            "rapo_result_type".to_string(),
            "rapo_process_id".to_string(),
        ];
        let input = vec![
            "call_id".to_string(),
            "amount".to_string(),
            "extra".to_string(),
            "rapo_result_type".to_string(),
        ];
        let sql = build_insert_sql("rapo_resa_x", "rapo_temp_error_a_4", &output, &input, 42);
        assert_eq!(
            sql,
            "INSERT INTO rapo_resa_x (`call_id`, `amount`, `rapo_result_type`, `rapo_process_id`)\n\
             SELECT t.`call_id`, t.`amount`, t.`rapo_result_type`, 42\n\
             FROM rapo_temp_error_a_4 t"
        );
    }

    #[test]
    fn test_insert_skips_columns_missing_from_input() {
        let output = vec![
            "call_id".to_string(),
            "legacy_col".to_string(),
            "rapo_process_id".to_string(),
        ];
        let input = vec!["call_id".to_string()];
        let sql = build_insert_sql("rapo_resa_x", "rapo_temp_stage_a_4", &output, &input, 7);
        assert!(!sql.contains("legacy_col"));
        assert!(sql.contains("(`call_id`, `rapo_process_id`)"));
    }
}
