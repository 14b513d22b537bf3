//! Match stabilizer: a fixed-point loop over the still-ambiguous pairs.
//! Each round selects mutually-preferred first choices, marks them
//! resolved, and repeats until nothing can be selected.
//!
//! Termination: every selected pair removes a key from the open set on both
//! sides, so the open set shrinks strictly per round and the loop finishes
//! within `min(|A|, |B|)` iterations.

use anyhow::{Context, Result};

use crate::db::schema;
use crate::engine::{Pipeline, Side, TempNames};
use crate::error::ControlError;

/// Build the selection CTAS for one round: unresolved `A`/`B`/`M` pairs
/// whose endpoints are both still open, where the pair is the first choice
/// of its A-side and of its B-side simultaneously.
pub fn build_mac_sql(names: &TempNames, hint: &str) -> String {
    format!(
        "CREATE TABLE {mac} AS\n\
         with open_pairs as (\n  \
         select m.a_id, m.b_id, m.key_value, m.time_shift_group_number,\n         \
         m.discrepancy_rank_a, m.discrepancy_rank_b,\n         \
         m.time_shift_rank_a, m.time_shift_rank_b\n  \
         from {matched} m\n  \
         join {org_a} oa on oa.a_id = m.a_id\n  \
         join {org_b} ob on ob.b_id = m.b_id\n  \
         where m.correlation_type in ('A', 'B', 'M')\n    \
         and m.correlation_indicator is null\n    \
         and oa.correlation_indicator is null\n    \
         and ob.correlation_indicator is null\n),\n\
         ranked as (\n  \
         select p.*,\n         \
         row_number() over (partition by p.a_id\n                            \
         order by p.discrepancy_rank_a, p.time_shift_rank_a, p.b_id) as pick_a,\n         \
         row_number() over (partition by p.b_id\n                            \
         order by p.discrepancy_rank_b, p.time_shift_rank_b, p.a_id) as pick_b\n  \
         from open_pairs p\n)\n\
         select {hint}a_id, b_id, key_value, time_shift_group_number\n\
         from ranked\nwhere pick_a = 1 and pick_b = 1",
        mac = names.mac(),
        matched = names.matched(),
        org_a = names.org(Side::A),
        org_b = names.org(Side::B),
        hint = hint,
    )
}

/// Mark the round's winners as resolved in the pair relation.
pub fn build_apply_pairs_sql(names: &TempNames) -> String {
    format!(
        "UPDATE {matched} m\n\
         join {mac} c\n  on m.a_id = c.a_id\n and m.b_id = c.b_id\n \
         and m.key_value = c.key_value\n \
         and m.time_shift_group_number = c.time_shift_group_number\n\
         set m.correlation_status = 'R', m.correlation_indicator = 'X'",
        matched = names.matched(),
        mac = names.mac(),
    )
}

/// Close the winners' keys on one side.
pub fn build_apply_org_sql(names: &TempNames, side: Side) -> String {
    let id = format!("{}_id", side.letter());
    format!(
        "UPDATE {org} o\n\
         join (select distinct {id} from {mac}) c on o.{id} = c.{id}\n\
         set o.correlation_status = 'R', o.correlation_indicator = 'X'",
        org = names.org(side),
        mac = names.mac(),
        id = id,
    )
}

/// Iterate selection rounds until the fixed point.
pub async fn stabilize(pipeline: &Pipeline<'_>, key_bound: i64) -> Result<()> {
    let names = pipeline.names();
    let max_rounds = (key_bound.max(0) as u64) + 1;
    let mut round: u64 = 0;
    loop {
        pipeline.checkpoint()?;
        schema::drop_table(pipeline.pool(), &names.mac()).await?;
        let sql = build_mac_sql(names, &pipeline.parallel_hint());
        pipeline
            .execute(&sql)
            .await
            .context("Failed to select stabilizer candidates")?;
        let selected = schema::count_rows(pipeline.pool(), &names.mac()).await?;
        if selected == 0 {
            log::info!(
                "{} Stabilizer converged after {} rounds",
                pipeline.tag(),
                round
            );
            return Ok(());
        }
        round += 1;
        if round > max_rounds {
            return Err(ControlError::StabilizerDiverged(max_rounds).into());
        }
        log::debug!(
            "{} Stabilizer round {}: {} pairs selected",
            pipeline.tag(),
            round,
            selected
        );
        pipeline
            .execute(&build_apply_pairs_sql(names))
            .await
            .context("Failed to apply stabilizer picks to pairs")?;
        for side in [Side::A, Side::B] {
            pipeline
                .execute(&build_apply_org_sql(names, side))
                .await
                .with_context(|| {
                    format!("Failed to apply stabilizer picks to side {}", side.letter())
                })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_sql_selects_mutual_first_choices() {
        let sql = build_mac_sql(&TempNames::new(11), "");
        assert!(sql.starts_with("CREATE TABLE rapo_temp_mac_11 AS"));
        assert!(sql.contains("where m.correlation_type in ('A', 'B', 'M')"));
        assert!(sql.contains("and m.correlation_indicator is null"));
        assert!(sql.contains("and oa.correlation_indicator is null"));
        assert!(sql.contains("and ob.correlation_indicator is null"));
        assert!(sql.contains(
            "order by p.discrepancy_rank_a, p.time_shift_rank_a, p.b_id) as pick_a"
        ));
        assert!(sql.contains(
            "order by p.discrepancy_rank_b, p.time_shift_rank_b, p.a_id) as pick_b"
        ));
        assert!(sql.contains("where pick_a = 1 and pick_b = 1"));
    }

    #[test]
    fn test_apply_pairs_marks_resolution() {
        let sql = build_apply_pairs_sql(&TempNames::new(11));
        assert!(sql.starts_with("UPDATE rapo_temp_mod_11 m"));
        assert!(sql.contains("join rapo_temp_mac_11 c"));
        assert!(sql.contains("set m.correlation_status = 'R', m.correlation_indicator = 'X'"));
    }

    #[test]
    fn test_apply_org_closes_keys() {
        let sql = build_apply_org_sql(&TempNames::new(11), Side::A);
        assert!(sql.contains("UPDATE rapo_temp_org_a_11 o"));
        assert!(sql.contains("select distinct a_id from rapo_temp_mac_11"));
    }
}
