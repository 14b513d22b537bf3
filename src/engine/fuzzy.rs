//! Fuzzy duplicate resolver: inside every balanced many-to-many cluster
//! (`F` groups), members are ordered per side and paired positionally.
//! Resolved pairs are recorded and propagated to the pair and key state.

use anyhow::{Context, Result};

use crate::engine::{Pipeline, Side, TempNames};

/// Build the CTAS selecting positional winners of `F` groups. When the
/// optimization is disabled the relation is still created, empty, so later
/// stages can join it unconditionally.
pub fn build_dup_sql(names: &TempNames, enabled: bool, hint: &str) -> String {
    let member_guard = if enabled { "" } else { " and 1 = 0" };
    format!(
        "CREATE TABLE {dup} AS\n\
         with members_a as (\n  \
         select key_value, time_shift_group_number, a_id,\n         \
         row_number() over (partition by key_value, time_shift_group_number\n                            \
         order by date_value_a, numeric_sum_a, a_id) as cluster_position_number\n  \
         from (select distinct key_value, time_shift_group_number, a_id,\n               \
         date_value_a, numeric_sum_a\n        \
         from {matched} where correlation_type = 'F'{guard}) da\n),\n\
         members_b as (\n  \
         select key_value, time_shift_group_number, b_id,\n         \
         row_number() over (partition by key_value, time_shift_group_number\n                            \
         order by date_value_b, numeric_sum_b, b_id) as cluster_position_number\n  \
         from (select distinct key_value, time_shift_group_number, b_id,\n               \
         date_value_b, numeric_sum_b\n        \
         from {matched} where correlation_type = 'F'{guard}) db\n),\n\
         paired as (\n  \
         select ma.key_value, ma.time_shift_group_number, ma.a_id, mb.b_id,\n         \
         ma.cluster_position_number\n  \
         from members_a ma\n  join members_b mb\n    \
         on ma.key_value = mb.key_value\n   \
         and ma.time_shift_group_number = mb.time_shift_group_number\n   \
         and ma.cluster_position_number = mb.cluster_position_number\n)\n\
         select {hint}p.*\nfrom paired p\n\
         join {matched} m\n  on m.a_id = p.a_id\n and m.b_id = p.b_id\n \
         and m.key_value = p.key_value\n \
         and m.time_shift_group_number = p.time_shift_group_number",
        dup = names.dup(),
        matched = names.matched(),
        guard = member_guard,
        hint = hint,
    )
}

/// Mark the positional winners as resolved in the pair relation.
pub fn build_mark_pairs_sql(names: &TempNames) -> String {
    format!(
        "UPDATE {matched} m\n\
         join {dup} d\n  on m.a_id = d.a_id\n and m.b_id = d.b_id\n \
         and m.key_value = d.key_value\n \
         and m.time_shift_group_number = d.time_shift_group_number\n\
         set m.correlation_status = 'R', m.correlation_indicator = 'X'",
        matched = names.matched(),
        dup = names.dup(),
    )
}

/// Propagate the resolution to the per-key summaries of one side.
pub fn build_mark_org_sql(names: &TempNames, side: Side) -> String {
    let id = format!("{}_id", side.letter());
    format!(
        "UPDATE {org} o\n\
         join (select distinct {id} from {dup}) d on o.{id} = d.{id}\n\
         set o.correlation_status = 'R', o.correlation_indicator = 'X'",
        org = names.org(side),
        dup = names.dup(),
        id = id,
    )
}

pub async fn resolve_duplicates(pipeline: &Pipeline<'_>) -> Result<()> {
    let enabled = pipeline.rules().fuzzy_optimization();
    let sql = build_dup_sql(pipeline.names(), enabled, &pipeline.parallel_hint());
    pipeline
        .execute(&sql)
        .await
        .context("Failed to materialize fuzzy duplicate resolutions")?;
    if !enabled {
        log::debug!(
            "{} Fuzzy optimization disabled; no positional resolution",
            pipeline.tag()
        );
        return Ok(());
    }

    let marked = pipeline
        .execute(&build_mark_pairs_sql(pipeline.names()))
        .await
        .context("Failed to mark fuzzy-resolved pairs")?;
    for side in [Side::A, Side::B] {
        pipeline
            .execute(&build_mark_org_sql(pipeline.names(), side))
            .await
            .with_context(|| format!("Failed to propagate fuzzy resolutions to side {}", side.letter()))?;
    }
    log::info!("{} Fuzzy resolution marked {} pairs", pipeline.tag(), marked);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dup_sql_positional_pairing() {
        let sql = build_dup_sql(&TempNames::new(5), true, "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_dup_5 AS"));
        assert!(sql.contains("order by date_value_a, numeric_sum_a, a_id"));
        assert!(sql.contains("order by date_value_b, numeric_sum_b, b_id"));
        assert!(sql.contains("and ma.cluster_position_number = mb.cluster_position_number"));
        assert!(sql.contains("where correlation_type = 'F'"));
        // only pairs that actually correlate survive
        assert!(sql.contains("join rapo_temp_mod_5 m"));
        assert!(!sql.contains("1 = 0"));
    }

    #[test]
    fn test_dup_sql_disabled_creates_empty_relation() {
        let sql = build_dup_sql(&TempNames::new(5), false, "");
        assert!(sql.contains("where correlation_type = 'F' and 1 = 0"));
    }

    #[test]
    fn test_mark_pairs_sets_resolution() {
        let sql = build_mark_pairs_sql(&TempNames::new(5));
        assert!(sql.starts_with("UPDATE rapo_temp_mod_5 m"));
        assert!(sql.contains("set m.correlation_status = 'R', m.correlation_indicator = 'X'"));
    }

    #[test]
    fn test_mark_org_propagates_indicator() {
        let sql = build_mark_org_sql(&TempNames::new(5), Side::B);
        assert!(sql.starts_with("UPDATE rapo_temp_org_b_5 o"));
        assert!(sql.contains("select distinct b_id from rapo_temp_dup_5"));
        assert!(sql.contains("set o.correlation_status = 'R', o.correlation_indicator = 'X'"));
    }
}
