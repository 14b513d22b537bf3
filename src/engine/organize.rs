//! Organizer: per-side summary of the matching topology. Each source key
//! gets the strongest correlation type among its pairs and an indicator
//! when a one-to-one pair already resolved it.

use anyhow::{Context, Result};

use crate::engine::{Pipeline, Side, TempNames};

/// Build the per-key summary CTAS for one side. Type priority is
/// O > F > A > B > M; the indicator is set iff the key has an `O` pair.
pub fn build_org_sql(names: &TempNames, side: Side, hint: &str) -> String {
    let id = format!("{}_id", side.letter());
    format!(
        "CREATE TABLE {org} AS\n\
         select {hint}{id},\n  \
         elt(min(case correlation_type\n        \
         when 'O' then 1 when 'F' then 2 when 'A' then 3\n        \
         when 'B' then 4 else 5 end), 'O', 'F', 'A', 'B', 'M') as correlation_type,\n  \
         max(case when correlation_type = 'O' then 'R' end) as correlation_status,\n  \
         max(case when correlation_type = 'O' then 'X' end) as correlation_indicator\n\
         from {matched}\ngroup by {id}",
        org = names.org(side),
        matched = names.matched(),
        hint = hint,
        id = id,
    )
}

pub async fn organize(pipeline: &Pipeline<'_>) -> Result<()> {
    for side in [Side::A, Side::B] {
        let sql = build_org_sql(pipeline.names(), side, &pipeline.parallel_hint());
        pipeline
            .execute(&sql)
            .await
            .with_context(|| format!("Failed to organize side {}", side.letter()))?;
        log::info!(
            "{} {} created",
            pipeline.tag(),
            pipeline.names().org(side)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_sql_side_a() {
        let sql = build_org_sql(&TempNames::new(3), Side::A, "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_org_a_3 AS"));
        assert!(sql.contains("group by a_id"));
        assert!(sql.contains("elt(min(case correlation_type"));
        assert!(sql.contains("when 'O' then 1 when 'F' then 2 when 'A' then 3"));
        assert!(sql.contains("max(case when correlation_type = 'O' then 'X' end)"));
        assert!(sql.contains("from rapo_temp_mod_3"));
    }

    #[test]
    fn test_org_sql_side_b() {
        let sql = build_org_sql(&TempNames::new(3), Side::B, "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_org_b_3 AS"));
        assert!(sql.contains("group by b_id"));
    }
}
