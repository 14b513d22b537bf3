//! The reconciliation pipeline.
//!
//! A run materializes a chain of per-process temporary tables inside the
//! database: windowed sources, the candidate-pair relation, per-key
//! summaries, fuzzy duplicate resolutions, stabilizer picks and finally the
//! per-side error and stage relations. Stages execute strictly in order;
//! the only concurrency is whatever degree the database applies to a single
//! statement.

pub mod classify;
pub mod correlate;
pub mod fetch;
pub mod fuzzy;
pub mod organize;
pub mod save;
pub mod stabilize;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use sqlx::MySqlPool;

use crate::db::{catalog, schema};
use crate::error::ControlError;
use crate::models::{ControlConfig, RuleConfig, RunTotals, SourceConfig};
use crate::window::ReportWindow;

/// The two mirrored data sources of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn letter(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    pub fn mirror(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Temporary table names for one process.
#[derive(Debug, Clone)]
pub struct TempNames {
    process_id: i64,
}

impl TempNames {
    pub fn new(process_id: i64) -> Self {
        Self { process_id }
    }

    pub fn source(&self, side: Side) -> String {
        format!("rapo_temp_source_{}_{}", side.letter(), self.process_id)
    }

    pub fn comb(&self) -> String {
        format!("rapo_temp_comb_{}", self.process_id)
    }

    pub fn matched(&self) -> String {
        format!("rapo_temp_mod_{}", self.process_id)
    }

    pub fn org(&self, side: Side) -> String {
        format!("rapo_temp_org_{}_{}", side.letter(), self.process_id)
    }

    pub fn dup(&self) -> String {
        format!("rapo_temp_dup_{}", self.process_id)
    }

    pub fn mac(&self) -> String {
        format!("rapo_temp_mac_{}", self.process_id)
    }

    pub fn error(&self, side: Side) -> String {
        format!("rapo_temp_error_{}_{}", side.letter(), self.process_id)
    }

    pub fn stage(&self, side: Side) -> String {
        format!("rapo_temp_stage_{}_{}", side.letter(), self.process_id)
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.source(Side::A),
            self.source(Side::B),
            self.comb(),
            self.matched(),
            self.org(Side::A),
            self.org(Side::B),
            self.dup(),
            self.mac(),
            self.error(Side::A),
            self.error(Side::B),
            self.stage(Side::A),
            self.stage(Side::B),
        ]
    }
}

/// Column inventory of a fetched source, including the synthesized key.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub rows: i64,
    pub columns: Vec<String>,
}

/// One pipeline execution bound to a process id.
pub struct Pipeline<'a> {
    pool: &'a MySqlPool,
    config: &'a ControlConfig,
    rules: &'a RuleConfig,
    window: ReportWindow,
    process_id: i64,
    names: TempNames,
    cancel: Option<Arc<AtomicBool>>,
    statement_timeout: Option<Duration>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        pool: &'a MySqlPool,
        config: &'a ControlConfig,
        rules: &'a RuleConfig,
        window: ReportWindow,
        process_id: i64,
    ) -> Self {
        Self {
            pool,
            config,
            rules,
            window,
            process_id,
            names: TempNames::new(process_id),
            cancel: None,
            statement_timeout: None,
        }
    }

    /// Attach a cancellation flag checked between stages.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Bound every statement; only set on asynchronous launches.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &MySqlPool {
        self.pool
    }

    pub fn config(&self) -> &ControlConfig {
        self.config
    }

    pub fn rules(&self) -> &RuleConfig {
        self.rules
    }

    pub fn window(&self) -> ReportWindow {
        self.window
    }

    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    pub fn names(&self) -> &TempNames {
        &self.names
    }

    pub fn source_config(&self, side: Side) -> &SourceConfig {
        match side {
            Side::A => &self.config.source_a,
            Side::B => &self.config.source_b,
        }
    }

    pub fn tag(&self) -> String {
        format!("[{}:{}]", self.config.control_name, self.process_id)
    }

    /// Degree-of-parallelism hint carried on generated statements.
    pub fn parallel_hint(&self) -> String {
        if self.config.parallelism > 1 {
            format!("/*+ PARALLEL({}) */ ", self.config.parallelism)
        } else {
            String::new()
        }
    }

    /// Fail the run when cancellation was requested. Checked between
    /// database round-trips; in-flight statements are never killed.
    pub fn checkpoint(&self) -> Result<(), ControlError> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(ControlError::Cancelled);
            }
        }
        Ok(())
    }

    /// Run one generated statement, logging it and applying the statement
    /// timeout when configured.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        log::debug!("{} Executing statement:\n{}", self.tag(), sql);
        let fut = schema::execute_statement(self.pool, sql);
        let affected = match self.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ControlError::Timeout(limit.as_secs()))?
                .map_err(ControlError::Db)?,
            None => fut.await.map_err(ControlError::Db)?,
        };
        Ok(affected)
    }

    /// Execute the full stage chain and report row counters.
    pub async fn run(&self) -> Result<RunTotals> {
        let mut totals = RunTotals::default();

        self.checkpoint()?;
        let source_a = fetch::fetch_source(self, Side::A).await?;
        let source_b = fetch::fetch_source(self, Side::B).await?;
        totals.fetched_a = source_a.rows;
        totals.fetched_b = source_b.rows;
        catalog::save_fetched(self.pool, self.process_id, &totals).await?;
        log::info!(
            "{} Records fetched: A={}, B={}",
            self.tag(),
            totals.fetched_a,
            totals.fetched_b
        );

        self.checkpoint()?;
        correlate::correlate(self, &totals).await?;

        self.checkpoint()?;
        organize::organize(self).await?;

        self.checkpoint()?;
        fuzzy::resolve_duplicates(self).await?;

        self.checkpoint()?;
        stabilize::stabilize(self, totals.fetched_a.min(totals.fetched_b)).await?;

        self.checkpoint()?;
        classify::classify(self, Side::A, &source_a).await?;
        classify::classify(self, Side::B, &source_b).await?;

        self.checkpoint()?;
        let outcome = save::persist(self).await?;
        totals.success_a = outcome.success_a;
        totals.success_b = outcome.success_b;
        totals.error_a = outcome.error_a;
        totals.error_b = outcome.error_b;
        catalog::save_outcome(self.pool, self.process_id, &totals).await?;

        Ok(totals)
    }

    /// Drop every temporary table of this process. Skipped in debug mode by
    /// the caller; errors are logged and swallowed so cleanup always tries
    /// every table.
    pub async fn cleanup(&self) {
        log::debug!("{} Deleting temporary tables...", self.tag());
        for table in self.names.all() {
            if let Err(error) = schema::drop_table(self.pool, &table).await {
                log::warn!("{} Failed to drop {}: {:#}", self.tag(), table, error);
            }
        }
        log::debug!("{} Temporary tables deleted", self.tag());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_names_follow_process_id() {
        let names = TempNames::new(415);
        assert_eq!(names.source(Side::A), "rapo_temp_source_a_415");
        assert_eq!(names.source(Side::B), "rapo_temp_source_b_415");
        assert_eq!(names.comb(), "rapo_temp_comb_415");
        assert_eq!(names.matched(), "rapo_temp_mod_415");
        assert_eq!(names.org(Side::A), "rapo_temp_org_a_415");
        assert_eq!(names.dup(), "rapo_temp_dup_415");
        assert_eq!(names.mac(), "rapo_temp_mac_415");
        assert_eq!(names.error(Side::B), "rapo_temp_error_b_415");
        assert_eq!(names.stage(Side::A), "rapo_temp_stage_a_415");
        assert_eq!(names.all().len(), 12);
    }

    #[test]
    fn test_side_mirror() {
        assert_eq!(Side::A.mirror(), Side::B);
        assert_eq!(Side::B.mirror(), Side::A);
        assert_eq!(Side::A.letter(), "a");
    }
}
