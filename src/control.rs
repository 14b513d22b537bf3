//! Control runner: loads a control from the catalogue, walks its run
//! through the status machine and drives the reconciliation pipeline.
//!
//! A run is `A` added, `Q` waiting, `S` started (preparation, prerequisite
//! and pre-run hook), `P` progress (the pipeline stages), then `D` done.
//! Failures end in `E`, cancellation and timeout in `C`. Temporary tables
//! are dropped on every terminal status unless debug mode keeps them for
//! inspection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime};
use sqlx::MySqlPool;
use tokio::task::JoinHandle;

use crate::config::AlgorithmDefaults;
use crate::db::catalog;
use crate::engine::Pipeline;
use crate::error::ControlError;
use crate::models::{ControlConfig, ControlKind, PeriodType, RuleConfig, RunStatus, RunTotals};
use crate::sql::datetime_literal;
use crate::window::{ReportWindow, resolve_window};

/// Terminal report of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub process_id: i64,
    pub status: RunStatus,
    pub totals: RunTotals,
}

/// Handle on an asynchronously launched run.
pub struct RunHandle {
    pub process_id: i64,
    cancel: Arc<AtomicBool>,
    join: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// Request cancellation; observed at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn wait(self) -> Result<RunOutcome> {
        self.join.await.context("Control run task panicked")?
    }
}

/// Substitute run variables into a configured statement.
pub fn render_statement(
    template: &str,
    control_name: &str,
    process_id: i64,
    window: ReportWindow,
) -> String {
    template
        .replace("{control_name}", control_name)
        .replace("{process_id}", &process_id.to_string())
        .replace("{date_from}", &datetime_literal(window.date_from))
        .replace("{date_to}", &datetime_literal(window.date_to))
}

pub struct Control {
    pool: MySqlPool,
    config: ControlConfig,
    rules: RuleConfig,
    window: ReportWindow,
    debug_mode: bool,
    cancel: Arc<AtomicBool>,
}

impl Control {
    /// Load a control from the catalogue and resolve its window against the
    /// current clock.
    pub async fn new(pool: &MySqlPool, name: &str, defaults: &AlgorithmDefaults) -> Result<Self> {
        Self::new_at(pool, name, defaults, Local::now().naive_local()).await
    }

    /// Load a control and resolve its window against an explicit clock.
    pub async fn new_at(
        pool: &MySqlPool,
        name: &str,
        defaults: &AlgorithmDefaults,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let config = catalog::read_control_config(pool, name).await?;
        if config.kind != ControlKind::Reconciliation {
            bail!(
                "Control {} has type {}; only reconciliation controls are executable here",
                name,
                config.kind.code()
            );
        }
        let rules = config.rule_config.clone().resolved(defaults);
        let window = resolve_window(
            now,
            config.period_back,
            config.period_number,
            config.period_type,
        )?;
        Ok(Self {
            pool: pool.clone(),
            config,
            rules,
            window,
            debug_mode: false,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Override the resolved window with explicit bounds.
    pub fn with_window(mut self, window: ReportWindow) -> Self {
        self.window = window;
        self
    }

    /// Keep temporary tables after the run for inspection.
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn window(&self) -> ReportWindow {
        self.window
    }

    fn tag(&self, process_id: Option<i64>) -> String {
        match process_id {
            Some(pid) => format!("[{}:{}]", self.config.control_name, pid),
            None => format!("[{}]", self.config.control_name),
        }
    }

    /// Run synchronously. The configured timeout is not applied on this
    /// path; only `launch()` honors it.
    pub async fn run(&self) -> Result<RunOutcome> {
        let process_id = self.initiate().await?;
        self.execute_run(process_id, None).await
    }

    /// Run on a background task with per-statement timeout enforcement.
    /// The returned handle carries the process id and a cancellation flag.
    pub async fn launch(self) -> Result<RunHandle> {
        let process_id = self.initiate().await?;
        let cancel = self.cancel.clone();
        let timeout = self
            .config
            .timeout
            .map(|seconds| Duration::from_secs(seconds as u64));
        let join = tokio::spawn(async move { self.execute_run(process_id, timeout).await });
        Ok(RunHandle {
            process_id,
            cancel,
            join,
        })
    }

    /// Execute every active iteration after the base run, each with a fresh
    /// process id. An iteration failure is logged and does not abort the
    /// remaining iterations.
    pub async fn iterate(&self) -> Result<Vec<RunOutcome>> {
        let now = Local::now().naive_local();
        let mut outcomes = Vec::new();
        for case in &self.config.iteration_config {
            if !case.is_active() {
                continue;
            }
            log::info!(
                "{} Iterating control with configuration {}",
                self.tag(None),
                case.iteration_id
            );
            let result: Result<RunOutcome> = async {
                let period_type = PeriodType::parse(&case.period_type)?;
                let window =
                    resolve_window(now, case.period_back, case.period_number, period_type)?;
                let iteration = Self {
                    pool: self.pool.clone(),
                    config: self.config.clone(),
                    rules: self.rules.clone(),
                    window,
                    debug_mode: self.debug_mode,
                    cancel: Arc::new(AtomicBool::new(false)),
                };
                iteration.run().await
            }
            .await;
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => log::error!(
                    "{} Iteration {} failed: {:#}",
                    self.tag(None),
                    case.iteration_id,
                    error
                ),
            }
        }
        Ok(outcomes)
    }

    /// Gate on the instance limit and register the run in the log.
    async fn initiate(&self) -> Result<i64> {
        log::info!("{} Initiating control...", self.tag(None));
        let running = catalog::count_active_runs(&self.pool, self.config.control_id).await?;
        if running >= self.config.instance_limit {
            return Err(ControlError::InstanceLimitReached {
                control: self.config.control_name.clone(),
                running,
                limit: self.config.instance_limit,
            }
            .into());
        }
        let process_id = catalog::insert_run(
            &self.pool,
            self.config.control_id,
            self.window.date_from,
            self.window.date_to,
        )
        .await?;
        log::info!(
            "{} Control owns process ID {}",
            self.tag(None),
            process_id
        );
        Ok(process_id)
    }

    async fn execute_run(&self, process_id: i64, timeout: Option<Duration>) -> Result<RunOutcome> {
        let result = self.advance(process_id, timeout).await;
        let outcome = match result {
            Ok(totals) => {
                catalog::update_status(&self.pool, process_id, RunStatus::Done).await?;
                RunOutcome {
                    process_id,
                    status: RunStatus::Done,
                    totals,
                }
            }
            Err(error) => {
                let status = self.record_failure(process_id, &error).await;
                RunOutcome {
                    process_id,
                    status,
                    totals: RunTotals::default(),
                }
            }
        };
        if self.debug_mode {
            log::info!(
                "{} Debug mode active; temporary tables retained",
                self.tag(Some(process_id))
            );
        } else {
            self.pipeline(process_id, None).cleanup().await;
        }
        if self.config.need_hook && self.config.need_postrun_hook {
            if let Err(error) = catalog::postrun_hook(&self.pool, process_id).await {
                log::error!(
                    "{} Postrun hook failed: {:#}",
                    self.tag(Some(process_id)),
                    error
                );
            }
        }
        log::info!(
            "{} Control ended with status {}",
            self.tag(Some(process_id)),
            outcome.status.code()
        );
        Ok(outcome)
    }

    async fn record_failure(&self, process_id: i64, error: &anyhow::Error) -> RunStatus {
        let control_error = error.downcast_ref::<ControlError>();
        let status = match control_error {
            Some(e) if e.is_cancellation() => RunStatus::Cancelled,
            _ => RunStatus::Error,
        };
        log::error!("{} Run failed: {:#}", self.tag(Some(process_id)), error);
        if status == RunStatus::Error
            && !matches!(control_error, Some(ControlError::PrerequisiteFailed(_)))
        {
            if let Err(save_error) =
                catalog::save_text_error(&self.pool, process_id, &format!("{:#}", error)).await
            {
                log::error!(
                    "{} Could not record run error: {:#}",
                    self.tag(Some(process_id)),
                    save_error
                );
            }
        }
        if let Err(update_error) = catalog::update_status(&self.pool, process_id, status).await {
            log::error!(
                "{} Could not record terminal status: {:#}",
                self.tag(Some(process_id)),
                update_error
            );
        }
        status
    }

    fn pipeline(&self, process_id: i64, timeout: Option<Duration>) -> Pipeline<'_> {
        let mut pipeline = Pipeline::new(
            &self.pool,
            &self.config,
            &self.rules,
            self.window,
            process_id,
        )
        .with_cancel(self.cancel.clone());
        if let Some(limit) = timeout {
            pipeline = pipeline.with_statement_timeout(limit);
        }
        pipeline
    }

    async fn advance(&self, process_id: i64, timeout: Option<Duration>) -> Result<RunTotals> {
        let tag = self.tag(Some(process_id));
        let pipeline = self.pipeline(process_id, timeout);

        catalog::update_status(&self.pool, process_id, RunStatus::Waiting).await?;
        pipeline.checkpoint()?;
        catalog::update_status(&self.pool, process_id, RunStatus::Started).await?;

        if let Some(template) = &self.config.preparation_sql {
            log::info!("{} Running preparation statement...", tag);
            let statement = render_statement(
                template,
                &self.config.control_name,
                process_id,
                self.window,
            );
            let rows = pipeline
                .execute(&statement)
                .await
                .context("Preparation statement failed")?;
            log::info!("{} Preparation statement affected {} rows", tag, rows);
        }

        if let Some(template) = &self.config.prerequisite_sql {
            log::info!("{} Checking prerequisite statement...", tag);
            let statement = render_statement(
                template,
                &self.config.control_name,
                process_id,
                self.window,
            );
            let value = catalog::fetch_scalar(&self.pool, &statement).await?;
            catalog::save_prerequisite_value(&self.pool, process_id, value).await?;
            log::info!("{} Prerequisite statement returned {:?}", tag, value);
            if value.unwrap_or(0) == 0 {
                let message = "Control execution stopped because the prerequisite \
                               check did not pass";
                catalog::save_text_message(&self.pool, process_id, message).await?;
                return Err(ControlError::PrerequisiteFailed(message.to_string()).into());
            }
        }

        if self.config.need_hook && self.config.need_prerun_hook {
            if let Some(code) = catalog::prerun_hook(&self.pool, process_id).await? {
                let message = format!(
                    "Control execution stopped by the prerun hook [{}]",
                    code
                );
                catalog::save_text_message(&self.pool, process_id, &message).await?;
                return Err(ControlError::PrerequisiteFailed(code).into());
            }
        }

        catalog::update_status(&self.pool, process_id, RunStatus::Progress).await?;
        pipeline.run().await
    }
}
