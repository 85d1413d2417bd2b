//! Ingestion orchestration: plans tuples, drives each through
//! fetch → reshape → load with bounded parallelism, retries failed tuples and
//! publishes a run report.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use nfw_core::{DateWindow, IngestTuple, MarketType, RawIdentifier, ReportType};
use nfw_reshape::Reshaper;
use nfw_upstream::{EmptyReason, FetchOutcome, PihpsClient, Upstream};
use nfw_warehouse::{
    DimensionResolver, LoadFailure, LoadReport, Loader, RejectedRow, RunMode, RunStart,
    Warehouse,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod plan;
pub mod report;

pub use catalog::{Catalog, TargetFilter, TargetScope};
pub use config::SyncConfig;
pub use plan::{incremental_window, plan_tuples, BackfillRequest};
pub use report::{
    report_recent_markdown, EmptyTuple, FailedStage, FileReportSink, NoopReportSink, ReportSink,
    RunReport, TupleFailure,
};

pub const CRATE_NAME: &str = "nfw-sync";

/// Per-tuple lifecycle. `Done`, `Empty` and `Failed` are terminal for a pass;
/// a retryable `Failed` tuple may be queued for another pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleState {
    Pending,
    Fetching,
    Reshaping,
    Loading,
    Done,
    Empty,
    Failed(FailedStage),
}

impl TupleState {
    pub fn can_transition_to(self, next: TupleState) -> bool {
        use TupleState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Reshaping)
                | (Fetching, Empty)
                | (Fetching, Failed(FailedStage::Fetching))
                | (Reshaping, Loading)
                | (Reshaping, Empty)
                | (Reshaping, Failed(FailedStage::Reshaping))
                | (Loading, Done)
                | (Loading, Failed(FailedStage::Loading))
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TupleState::Done | TupleState::Empty | TupleState::Failed(_)
        )
    }
}

/// Cooperative cancellation, observed at tuple boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSummary {
    pub provinces: usize,
    pub commodities: usize,
    pub subcategories: usize,
    pub market_types: usize,
}

#[derive(Debug)]
struct TupleResult {
    tuple: IngestTuple,
    state: TupleState,
    fetched: bool,
    http_attempts: usize,
    retryable: bool,
    drafts: usize,
    missing_cells: usize,
    load: LoadReport,
    empty_reason: Option<EmptyReason>,
    error: Option<String>,
}

impl TupleResult {
    fn new(tuple: IngestTuple) -> Self {
        Self {
            tuple,
            state: TupleState::Pending,
            fetched: false,
            http_attempts: 0,
            retryable: false,
            drafts: 0,
            missing_cells: 0,
            load: LoadReport::default(),
            empty_reason: None,
            error: None,
        }
    }

    fn advance(&mut self, next: TupleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal tuple transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "tuple state");
        self.state = next;
    }
}

struct Stages {
    upstream: Arc<dyn Upstream>,
    reshaper: Reshaper,
    loader: Loader,
}

impl Stages {
    async fn run_tuple(&self, tuple: IngestTuple) -> TupleResult {
        let span = info_span!("ingest_tuple", tuple = %tuple);
        async move {
            let mut result = TupleResult::new(tuple);
            result.advance(TupleState::Fetching);

            let raw = match self.upstream.fetch(&result.tuple).await {
                FetchOutcome::Response(raw) => raw,
                FetchOutcome::Empty(empty) => {
                    result.advance(TupleState::Empty);
                    result.empty_reason = Some(empty.reason);
                    info!("no data");
                    return result;
                }
                FetchOutcome::Failure(failure) => {
                    result.advance(TupleState::Failed(FailedStage::Fetching));
                    result.http_attempts = failure.attempts;
                    result.retryable = failure.retryable;
                    warn!(attempts = failure.attempts, error = %failure.last_error, "fetch failed");
                    result.error = Some(failure.last_error);
                    return result;
                }
            };
            result.fetched = true;

            result.advance(TupleState::Reshaping);
            let reshaped =
                self.reshaper
                    .reshape(&raw, &result.tuple.target, result.tuple.market_type);
            result.drafts = reshaped.drafts.len();
            result.missing_cells = reshaped.missing_cells;
            if reshaped.drafts.is_empty() && reshaped.rejected.is_empty() {
                result.advance(TupleState::Empty);
                result.empty_reason = Some(EmptyReason::NoData);
                info!(missing = reshaped.missing_cells, "grid held no prices");
                return result;
            }
            for rejected in &reshaped.rejected {
                warn!(error = %rejected, "cell rejected");
            }

            result.advance(TupleState::Loading);
            let mut load = self.loader.upsert(&reshaped.drafts).await;
            let write_layer_down = load.failed_at_write_layer();
            let mut rejected: Vec<RejectedRow> = reshaped
                .rejected
                .into_iter()
                .map(|err| RejectedRow {
                    cell: err.cell().clone(),
                    reason: LoadFailure::Validation(err),
                })
                .collect();
            rejected.append(&mut load.rejected);
            load.rejected = rejected;

            if write_layer_down {
                result.advance(TupleState::Failed(FailedStage::Loading));
                result.retryable = true;
                result.error = load
                    .rejected
                    .iter()
                    .find(|row| !matches!(row.reason, LoadFailure::Validation(_)))
                    .map(|row| row.reason.to_string());
                warn!(rejected = load.rejected.len(), "every row failed to write");
            } else {
                result.advance(TupleState::Done);
                info!(
                    inserted = load.inserted,
                    updated = load.updated,
                    unchanged = load.unchanged,
                    rejected = load.rejected.len(),
                    "tuple loaded"
                );
            }
            result.load = load;
            result
        }
        .instrument(span)
        .await
    }
}

pub struct IngestPipeline {
    config: SyncConfig,
    catalog: Catalog,
    warehouse: Arc<dyn Warehouse>,
    stages: Arc<Stages>,
    sink: Box<dyn ReportSink>,
    cancel: CancelSignal,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        catalog: Catalog,
        warehouse: Arc<dyn Warehouse>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let resolver = Arc::new(DimensionResolver::new(warehouse.clone()));
        let loader = Loader::new(warehouse.clone(), resolver);
        let reshaper = Reshaper::new(catalog.province_directory(), catalog.source_tag.clone());
        Self {
            config,
            catalog,
            warehouse,
            stages: Arc::new(Stages {
                upstream,
                reshaper,
                loader,
            }),
            sink: Box::new(NoopReportSink),
            cancel: CancelSignal::default(),
        }
    }

    pub fn with_report_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Create every catalog dimension row up front.
    pub async fn seed(&self) -> Result<SeedSummary> {
        let resolver = self.stages.loader.resolver();
        let mut summary = SeedSummary::default();

        for province in &self.catalog.provinces {
            resolver
                .resolve(&RawIdentifier::Province(province.province_ref()))
                .await
                .with_context(|| format!("seeding province {}", province.code))?;
            summary.provinces += 1;
        }
        for commodity in &self.catalog.commodities {
            let commodity_ref = commodity.commodity_ref();
            resolver
                .resolve(&RawIdentifier::Commodity(commodity_ref.clone()))
                .await
                .with_context(|| format!("seeding commodity {}", commodity.code))?;
            summary.commodities += 1;
            for sub in &commodity.subcategories {
                resolver
                    .resolve(&RawIdentifier::Subcategory {
                        commodity: commodity_ref.clone(),
                        name: sub.name.clone(),
                    })
                    .await
                    .with_context(|| format!("seeding subcategory {}", sub.code))?;
                summary.subcategories += 1;
            }
        }
        for market_type in MarketType::ALL {
            resolver
                .resolve(&RawIdentifier::MarketType(market_type))
                .await
                .with_context(|| format!("seeding market type {market_type}"))?;
            summary.market_types += 1;
        }

        info!(?summary, "dimensions seeded");
        Ok(summary)
    }

    /// Daily run over every catalog series since the last successful run.
    pub async fn run_incremental(&self, today: NaiveDate) -> Result<RunReport> {
        let last_success = self
            .warehouse
            .last_successful_window_end(ReportType::Daily)
            .await
            .context("reading last successful run")?;
        let window = incremental_window(
            today,
            last_success,
            self.config.incremental_max_lookback_days,
        );
        let targets = self.catalog.targets(&TargetFilter::default())?;
        let tuples = plan_tuples(
            &targets,
            &self.catalog.market_types,
            ReportType::Daily,
            window,
            self.config.upstream.max_window_days(ReportType::Daily),
        );
        info!(%window, ?last_success, tuples = tuples.len(), "incremental run planned");
        self.execute(RunMode::Incremental, ReportType::Daily, window, tuples)
            .await
    }

    pub async fn run_backfill(&self, request: &BackfillRequest) -> Result<RunReport> {
        let window = request.window()?;
        let targets = self.catalog.targets(&request.filter)?;
        let market_types = if request.market_types.is_empty() {
            self.catalog.market_types.clone()
        } else {
            request.market_types.clone()
        };
        let tuples = plan_tuples(
            &targets,
            &market_types,
            request.report_type,
            window,
            self.config.upstream.max_window_days(request.report_type),
        );
        info!(%window, report_type = %request.report_type, tuples = tuples.len(), "backfill planned");
        self.execute(RunMode::Backfill, request.report_type, window, tuples)
            .await
    }

    async fn execute(
        &self,
        mode: RunMode,
        report_type: ReportType,
        window: DateWindow,
        tuples: Vec<IngestTuple>,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.warehouse
            .record_run_started(&RunStart {
                run_id,
                mode,
                report_type,
                window_start: window.start(),
                window_end: window.end(),
                started_at,
            })
            .await
            .context("recording run start")?;

        let mut report = RunReport::new(run_id, mode, report_type, window, started_at);
        report.tuples_planned = tuples.len();

        let mut finals: HashMap<IngestTuple, TupleResult> = HashMap::new();
        let mut passes: HashMap<IngestTuple, usize> = HashMap::new();
        let mut queue = tuples;
        let mut not_started = Vec::new();

        for pass in 0..=self.config.tuple_retry_passes {
            if queue.is_empty() {
                break;
            }
            if pass > 0 {
                report.retry_passes += 1;
                info!(pass, tuples = queue.len(), "retrying failed tuples");
            }
            let (results, skipped) = self.run_pass(std::mem::take(&mut queue)).await;
            for result in results {
                *passes.entry(result.tuple.clone()).or_default() += 1;
                if matches!(result.state, TupleState::Failed(_)) && result.retryable {
                    queue.push(result.tuple.clone());
                }
                finals.insert(result.tuple.clone(), result);
            }
            // Failed tuples that never got a retry slot keep their last result.
            not_started.extend(skipped.into_iter().filter(|t| !finals.contains_key(t)));
            if self.cancel.is_cancelled() {
                break;
            }
        }

        report.cancelled = self.cancel.is_cancelled();
        report.tuples_not_started = not_started.len();
        report.tuples_attempted = finals.len();
        for result in finals.into_values() {
            self.aggregate(&mut report, result, &passes);
        }
        report.finished_at = Utc::now();

        let status = report.status();
        let report_json = serde_json::to_value(&report).context("serializing run report")?;
        // Ledger failures are logged; the report is still published and returned.
        if let Err(err) = self
            .warehouse
            .record_run_finished(run_id, status, report.finished_at, &report_json)
            .await
        {
            warn!(%run_id, error = %err, "failed to record run finish");
        }
        if let Err(err) = self.sink.publish(&report).await {
            warn!(error = %err, "failed to publish run report");
        }

        info!(
            %run_id,
            status = status.as_str(),
            done = report.tuples_done,
            empty = report.tuples_empty,
            failed = report.tuples_failed,
            inserted = report.inserted,
            updated = report.updated,
            rejected = report.rejected,
            "run finished"
        );
        Ok(report)
    }

    /// One sweep over `tuples` with at most `workers` in flight. Tuples not
    /// yet started when cancellation is observed are handed back.
    async fn run_pass(&self, tuples: Vec<IngestTuple>) -> (Vec<TupleResult>, Vec<IngestTuple>) {
        let slots = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut set = JoinSet::new();
        let mut skipped = Vec::new();
        let mut tuples = tuples.into_iter();

        for tuple in tuples.by_ref() {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                skipped.push(tuple);
                break;
            };
            if self.cancel.is_cancelled() {
                info!("cancellation requested, not starting further tuples");
                skipped.push(tuple);
                break;
            }
            let stages = self.stages.clone();
            set.spawn(async move {
                let _permit = permit;
                stages.run_tuple(tuple).await
            });
        }
        skipped.extend(tuples);

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "tuple worker aborted"),
            }
        }
        (results, skipped)
    }

    fn aggregate(
        &self,
        report: &mut RunReport,
        result: TupleResult,
        passes: &HashMap<IngestTuple, usize>,
    ) {
        if result.fetched {
            report.payloads_fetched += 1;
        }
        report.drafts += result.drafts;
        report.missing_cells += result.missing_cells;

        match result.state {
            TupleState::Done => {
                report.tuples_done += 1;
                report.inserted += result.load.inserted;
                report.updated += result.load.updated;
                report.unchanged += result.load.unchanged;
                report.record_rejections(result.load.rejected);
            }
            TupleState::Empty => {
                report.tuples_empty += 1;
                report.empty.push(EmptyTuple {
                    tuple: result.tuple.to_string(),
                    reason: result.empty_reason.unwrap_or(EmptyReason::NoData),
                });
            }
            TupleState::Failed(stage) => {
                report.tuples_failed += 1;
                report.failures.push(TupleFailure {
                    tuple: result.tuple.to_string(),
                    stage,
                    passes: passes.get(&result.tuple).copied().unwrap_or(1),
                    http_attempts: result.http_attempts,
                    retryable: result.retryable,
                    error: result.error.unwrap_or_default(),
                });
                report.record_rejections(result.load.rejected);
            }
            other => warn!(tuple = %result.tuple, state = ?other, "tuple ended in a non-terminal state"),
        }
    }
}

/// Wire the production pipeline from `config`: warehouse, catalog, HTTP
/// client and file report sink.
pub async fn pipeline_from_config(config: SyncConfig) -> Result<IngestPipeline> {
    let warehouse = nfw_warehouse::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to warehouse")?;
    warehouse.migrate().await.context("running migrations")?;
    let catalog = Catalog::load(&config.catalog_path)?;
    let upstream = PihpsClient::new(config.upstream.clone())?;
    let sink = FileReportSink::new(config.reports_dir.clone());
    Ok(IngestPipeline::new(config, catalog, warehouse, Arc::new(upstream))
        .with_report_sink(Box::new(sink)))
}
