//! Monthly work-assignment reconciliation pipeline: roster load, month
//! snapshots, carry-forward preview, and batched bulk save with bounded
//! retry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use amr_api::{ApiError, BackOfficeApi, RestConfig};
use amr_core::{
    AssignmentRecord, BuildCode, ClientRecord, CompanyStatus, EmployeeId, NewAssignment,
    PreviewRow, Role, RoleAssignments, StatusFilter, TaxMonth, VatStatus,
};

pub const CRATE_NAME: &str = "amr-pipeline";

/// Explicit user edits, keyed by build then role. A recorded edit always
/// carries a value; clearing an edit reverts the field to its default.
pub type EditMap = HashMap<BuildCode, HashMap<Role, EmployeeId>>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A roster, snapshot, or duplicate-check call failed. The run
    /// aborts; partial data is never accepted silently.
    #[error("{stage} failed: {source}")]
    LoadFailure {
        stage: &'static str,
        #[source]
        source: ApiError,
    },
    /// The preview session has no rows at all.
    #[error("nothing to save: the preview is empty")]
    EmptyPreview,
    /// Filtering left nothing to commit (all rows incomplete and/or
    /// already assigned for their target month).
    #[error("no valid rows left to commit after filtering")]
    NoValidRows,
}

// --- config ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_statuses")]
    pub default_statuses: Vec<CompanyStatus>,
}

fn default_base_url() -> String {
    "http://localhost:8600/api".to_string()
}

fn default_http_timeout_secs() -> u64 {
    20
}

fn default_user_agent() -> String {
    "amr/0.1".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_inter_batch_delay_ms() -> u64 {
    300
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_statuses() -> Vec<CompanyStatus> {
    vec![
        CompanyStatus::MonthlyActive,
        CompanyStatus::MonthlyDormant,
        CompanyStatus::MonthlyAnnualPay,
        CompanyStatus::MonthlyFinalMonth,
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
            batch_size: default_batch_size(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            reports_dir: default_reports_dir(),
            default_statuses: default_statuses(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("AMR_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(dir) = std::env::var("AMR_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = std::env::var("AMR_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.http_timeout_secs = timeout;
        }
        config
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn status_filter(&self) -> StatusFilter {
        if self.default_statuses.is_empty() {
            StatusFilter::All
        } else {
            StatusFilter::any(self.default_statuses.iter().copied())
        }
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Bounded per-row retry: `max_attempts` total tries, exponential
/// backoff doubling from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

// --- roster + snapshots ---------------------------------------------------

/// Load the client roster for the selected statuses, one query per
/// status, deduplicated by build (first occurrence wins). Any fetch
/// error aborts the whole load.
pub async fn load_roster(
    api: &dyn BackOfficeApi,
    filter: &StatusFilter,
) -> Result<Vec<ClientRecord>, PipelineError> {
    let span = info_span!("load_roster");
    let _guard = span.enter();

    let queries = match filter {
        StatusFilter::All => vec![StatusFilter::All],
        StatusFilter::Any(statuses) => statuses
            .iter()
            .map(|status| StatusFilter::any([*status]))
            .collect(),
    };

    let mut seen: HashSet<BuildCode> = HashSet::new();
    let mut roster = Vec::new();
    for query in &queries {
        let clients = api
            .list_clients(query)
            .await
            .map_err(|source| PipelineError::LoadFailure {
                stage: "roster load",
                source,
            })?;
        for client in clients {
            if seen.insert(client.build.clone()) {
                roster.push(client);
            }
        }
    }
    info!(clients = roster.len(), "roster loaded");
    Ok(roster)
}

/// One batch lookup for `month`, keyed by build. A build without a
/// record is simply absent; a failed call aborts rather than degrading
/// to per-client fetches.
pub async fn fetch_snapshots(
    api: &dyn BackOfficeApi,
    builds: &[BuildCode],
    month: TaxMonth,
) -> Result<HashMap<BuildCode, AssignmentRecord>, PipelineError> {
    let span = info_span!("fetch_snapshots", %month);
    let _guard = span.enter();

    let records = api
        .assignments_for_month(builds, month)
        .await
        .map_err(|source| PipelineError::LoadFailure {
            stage: "snapshot fetch",
            source,
        })?;
    Ok(records
        .into_iter()
        .map(|record| (record.build.clone(), record))
        .collect())
}

// --- preview --------------------------------------------------------------

/// Merge roster and month snapshots into editable preview rows.
///
/// Per-field precedence for the editable value: explicit user edit,
/// then the target month's existing assignment (when one exists), then
/// the reference month's value as carry-forward default. The `previous`
/// slots always mirror the reference snapshot, for display only.
///
/// The VAT-filer slot is disabled for clients that are not
/// VAT-registered: no default, no edit, nothing reaches the editable
/// value. The `previous` slot still shows it.
pub fn build_preview(
    roster: &[ClientRecord],
    previous: &HashMap<BuildCode, AssignmentRecord>,
    target: &HashMap<BuildCode, AssignmentRecord>,
    edits: &EditMap,
    target_month: TaxMonth,
) -> Vec<PreviewRow> {
    roster
        .iter()
        .map(|client| {
            let previous_roles = previous
                .get(&client.build)
                .map(|record| record.roles.clone())
                .unwrap_or_default();
            let target_record = target.get(&client.build);
            let is_assigned = target_record.is_some();
            let row_edits = edits.get(&client.build);
            let vat_enabled = client.vat_status == VatStatus::Registered;

            let mut new = RoleAssignments::default();
            for role in Role::ALL {
                if role == Role::VatFiler && !vat_enabled {
                    continue;
                }
                let edited = row_edits.and_then(|fields| fields.get(&role));
                let default = if is_assigned {
                    target_record.and_then(|record| record.roles.get(role))
                } else {
                    previous_roles.get(role)
                };
                new.set(role, edited.or(default).cloned());
            }

            PreviewRow {
                build: client.build.clone(),
                company_name: client.company_name.clone(),
                vat_status: client.vat_status,
                company_status: client.company_status,
                target_month,
                is_assigned,
                previous: previous_roles,
                new,
            }
        })
        .collect()
}

/// One reconciliation session: the loaded roster, both month snapshots,
/// the user's edits, and the merged preview rows. Edits survive filter
/// and reference-month changes; only successfully saved rows leave the
/// session.
pub struct ReconcileSession {
    api: Arc<dyn BackOfficeApi>,
    filter: StatusFilter,
    reference_month: TaxMonth,
    target_month: TaxMonth,
    roster: Vec<ClientRecord>,
    previous: HashMap<BuildCode, AssignmentRecord>,
    target: HashMap<BuildCode, AssignmentRecord>,
    edits: EditMap,
    rows: Vec<PreviewRow>,
}

impl ReconcileSession {
    pub fn new(api: Arc<dyn BackOfficeApi>, filter: StatusFilter, target_month: TaxMonth) -> Self {
        Self {
            api,
            filter,
            reference_month: target_month.previous(),
            target_month,
            roster: Vec::new(),
            previous: HashMap::new(),
            target: HashMap::new(),
            edits: EditMap::new(),
            rows: Vec::new(),
        }
    }

    /// Override the carry-forward reference month before the first
    /// `load`.
    pub fn with_reference_month(mut self, month: TaxMonth) -> Self {
        self.reference_month = month;
        self
    }

    pub fn rows(&self) -> &[PreviewRow] {
        &self.rows
    }

    pub fn target_month(&self) -> TaxMonth {
        self.target_month
    }

    pub fn reference_month(&self) -> TaxMonth {
        self.reference_month
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fetch roster and both snapshots, then rebuild the preview. Any
    /// prior edits are merged back in, never discarded.
    pub async fn load(&mut self) -> Result<(), PipelineError> {
        let roster = load_roster(self.api.as_ref(), &self.filter).await?;
        let builds: Vec<BuildCode> = roster.iter().map(|client| client.build.clone()).collect();
        self.previous = fetch_snapshots(self.api.as_ref(), &builds, self.reference_month).await?;
        self.target = fetch_snapshots(self.api.as_ref(), &builds, self.target_month).await?;
        self.roster = roster;
        self.rebuild_rows();
        Ok(())
    }

    pub async fn set_filter(&mut self, filter: StatusFilter) -> Result<(), PipelineError> {
        self.filter = filter;
        self.load().await
    }

    pub async fn set_reference_month(&mut self, month: TaxMonth) -> Result<(), PipelineError> {
        self.reference_month = month;
        self.load().await
    }

    /// Record (or clear) an edit and re-merge the preview. Passing
    /// `None` removes the edit so the field falls back to its default.
    /// VAT-filer edits are ignored for clients whose slot is disabled.
    pub fn apply_edit(&mut self, build: &str, role: Role, value: Option<EmployeeId>) {
        if role == Role::VatFiler {
            let enabled = self
                .roster
                .iter()
                .find(|client| client.build == build)
                .map(|client| client.vat_status == VatStatus::Registered)
                .unwrap_or(false);
            if !enabled {
                return;
            }
        }
        match value {
            Some(employee) => {
                self.edits
                    .entry(build.to_string())
                    .or_default()
                    .insert(role, employee);
            }
            None => {
                if let Some(fields) = self.edits.get_mut(build) {
                    fields.remove(&role);
                    if fields.is_empty() {
                        self.edits.remove(build);
                    }
                }
            }
        }
        self.rebuild_rows();
    }

    fn rebuild_rows(&mut self) {
        self.rows = build_preview(
            &self.roster,
            &self.previous,
            &self.target,
            &self.edits,
            self.target_month,
        );
    }

    /// Drop rows (and their edits) that were committed, keeping the
    /// rest in place for correction and retry.
    pub fn retain_unsaved(&mut self, saved: &HashSet<BuildCode>) {
        self.roster.retain(|client| !saved.contains(&client.build));
        self.edits.retain(|build, _| !saved.contains(build));
        self.rows.retain(|row| !saved.contains(&row.build));
    }

    /// Run the bulk save over the current rows; on a completed run the
    /// saved rows leave the session.
    pub async fn save(
        &mut self,
        executor: &BulkSaveExecutor,
        options: &SaveOptions,
    ) -> Result<SaveOutcome, PipelineError> {
        let outcome = executor.run(self.rows.clone(), options).await?;
        if let SaveOutcome::Completed(summary) = &outcome {
            self.retain_unsaved(&summary.saved_builds());
        }
        Ok(outcome)
    }
}

// --- bulk save ------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Commit the complete rows even when incomplete rows exist.
    pub skip_incomplete: bool,
    /// Commit past rows that already have a target-month record.
    pub skip_duplicates: bool,
    /// Checked between batches; remaining rows are reported as
    /// skipped rather than committed.
    pub abort: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteRow {
    pub build: BuildCode,
    pub missing: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub build: BuildCode,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Distinct per-row target months covered by this run.
    pub target_months: Vec<TaxMonth>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<BuildCode>,
    pub failed: Vec<RowFailure>,
    pub skipped_incomplete: Vec<BuildCode>,
    pub skipped_duplicate: Vec<BuildCode>,
    pub skipped_aborted: Vec<BuildCode>,
}

impl RunSummary {
    pub fn saved_builds(&self) -> HashSet<BuildCode> {
        self.succeeded.iter().cloned().collect()
    }

    fn months_display(&self) -> String {
        self.target_months
            .iter()
            .map(|month| month.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Bulk Save Summary".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Target months: {}", self.months_display()),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Succeeded: {}", self.succeeded.len()),
            format!("- Failed: {}", self.failed.len()),
            format!("- Skipped (incomplete): {}", self.skipped_incomplete.len()),
            format!("- Skipped (duplicate): {}", self.skipped_duplicate.len()),
            format!("- Skipped (aborted): {}", self.skipped_aborted.len()),
        ];
        if !self.failed.is_empty() {
            lines.push(String::new());
            lines.push("## Failed Rows".to_string());
            for failure in &self.failed {
                lines.push(format!("- `{}`: {}", failure.build, failure.error));
            }
        }
        lines.join("\n")
    }
}

/// Terminal state of one bulk-save invocation. The blocked variants
/// return control to the caller, who decides between skip-and-continue
/// and abort.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    BlockedIncomplete(Vec<IncompleteRow>),
    BlockedDuplicates(Vec<BuildCode>),
    Completed(RunSummary),
}

/// Sequential-phase bulk save: completeness gate, duplicate gate, then
/// batched concurrent commit with bounded per-row retry.
pub struct BulkSaveExecutor {
    api: Arc<dyn BackOfficeApi>,
    batch_size: usize,
    retry: RetryPolicy,
    inter_batch_delay: Duration,
}

impl BulkSaveExecutor {
    pub fn new(api: Arc<dyn BackOfficeApi>) -> Self {
        Self {
            api,
            batch_size: default_batch_size(),
            retry: RetryPolicy::default(),
            inter_batch_delay: Duration::from_millis(default_inter_batch_delay_ms()),
        }
    }

    pub fn from_config(api: Arc<dyn BackOfficeApi>, config: &PipelineConfig) -> Self {
        Self {
            api,
            batch_size: config.batch_size.max(1),
            retry: config.retry_policy(),
            inter_batch_delay: Duration::from_millis(config.inter_batch_delay_ms),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    /// Partition rows by completeness of their required roles.
    pub fn validate(rows: &[PreviewRow]) -> (Vec<PreviewRow>, Vec<IncompleteRow>) {
        let mut complete = Vec::new();
        let mut incomplete = Vec::new();
        for row in rows {
            let missing = row.missing_roles();
            if missing.is_empty() {
                complete.push(row.clone());
            } else {
                incomplete.push(IncompleteRow {
                    build: row.build.clone(),
                    missing,
                });
            }
        }
        (complete, incomplete)
    }

    /// Builds that already have a record at their row's target month.
    /// Rows are grouped by target month explicitly; one session may mix
    /// months and each group gets its own batch lookup.
    pub async fn detect_duplicates(
        &self,
        rows: &[PreviewRow],
    ) -> Result<Vec<BuildCode>, PipelineError> {
        let mut by_month: BTreeMap<TaxMonth, Vec<BuildCode>> = BTreeMap::new();
        for row in rows {
            by_month
                .entry(row.target_month)
                .or_default()
                .push(row.build.clone());
        }

        let mut duplicates = Vec::new();
        for (month, builds) in by_month {
            let existing = self
                .api
                .find_duplicate_assignments(&builds, month)
                .await
                .map_err(|source| PipelineError::LoadFailure {
                    stage: "duplicate check",
                    source,
                })?;
            duplicates.extend(existing.into_iter().map(|record| record.build));
        }
        duplicates.sort();
        duplicates.dedup();
        Ok(duplicates)
    }

    /// Run all phases over `rows`. Incomplete and duplicate rows block
    /// unless the matching `SaveOptions` skip flag is set.
    pub async fn run(
        &self,
        rows: Vec<PreviewRow>,
        options: &SaveOptions,
    ) -> Result<SaveOutcome, PipelineError> {
        if rows.is_empty() {
            return Err(PipelineError::EmptyPreview);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let target_months: Vec<TaxMonth> = rows
            .iter()
            .map(|row| row.target_month)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let span = info_span!("bulk_save", %run_id, rows = rows.len());
        let _guard = span.enter();

        let (complete, incomplete) = Self::validate(&rows);
        if !incomplete.is_empty() && !options.skip_incomplete {
            info!(incomplete = incomplete.len(), "blocked on incomplete rows");
            return Ok(SaveOutcome::BlockedIncomplete(incomplete));
        }
        let skipped_incomplete: Vec<BuildCode> =
            incomplete.iter().map(|row| row.build.clone()).collect();

        let duplicates = self.detect_duplicates(&complete).await?;
        if !duplicates.is_empty() && !options.skip_duplicates {
            info!(duplicates = duplicates.len(), "blocked on duplicate rows");
            return Ok(SaveOutcome::BlockedDuplicates(duplicates));
        }
        let duplicate_set: HashSet<&BuildCode> = duplicates.iter().collect();
        let write_set: Vec<PreviewRow> = complete
            .into_iter()
            .filter(|row| !duplicate_set.contains(&row.build))
            .collect();
        if write_set.is_empty() {
            return Err(PipelineError::NoValidRows);
        }

        let (succeeded, failed, skipped_aborted) =
            self.commit(write_set, options.abort.as_deref()).await;

        let summary = RunSummary {
            run_id,
            target_months,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            skipped_incomplete,
            skipped_duplicate: duplicates,
            skipped_aborted,
        };
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "bulk save finished"
        );
        Ok(SaveOutcome::Completed(summary))
    }

    /// Commit in fixed-size batches. Rows within a batch fan out
    /// concurrently, capping in-flight creates at the batch size; one
    /// row's failure never aborts its siblings.
    async fn commit(
        &self,
        rows: Vec<PreviewRow>,
        abort: Option<&AtomicBool>,
    ) -> (Vec<BuildCode>, Vec<RowFailure>, Vec<BuildCode>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut skipped_aborted = Vec::new();

        let batches: Vec<&[PreviewRow]> = rows.chunks(self.batch_size).collect();
        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
            if abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                warn!(batch = index, "abort requested; skipping remaining batches");
                skipped_aborted.extend(
                    batches[index..]
                        .iter()
                        .flat_map(|rest| rest.iter().map(|row| row.build.clone())),
                );
                break;
            }

            let mut tasks = JoinSet::new();
            for row in batch.iter() {
                let assignment = NewAssignment {
                    build: row.build.clone(),
                    month: row.target_month,
                    roles: row.new.clone(),
                };
                tasks.spawn(save_row(self.api.clone(), self.retry, assignment));
            }
            while let Some(joined) = tasks.join_next().await {
                match joined.expect("row save task panicked") {
                    Ok(build) => succeeded.push(build),
                    Err((build, error)) => {
                        warn!(build = %build, error = %error, "row failed permanently");
                        failed.push(RowFailure {
                            build,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        succeeded.sort();
        failed.sort_by(|a, b| a.build.cmp(&b.build));
        (succeeded, failed, skipped_aborted)
    }
}

/// One row's create with bounded retry. Only transient failures are
/// retried; backoff doubles per attempt. A retry delay here suspends
/// only this row, never its batch siblings.
async fn save_row(
    api: Arc<dyn BackOfficeApi>,
    retry: RetryPolicy,
    assignment: NewAssignment,
) -> Result<BuildCode, (BuildCode, ApiError)> {
    let build = assignment.build.clone();
    let mut last_transient: Option<ApiError> = None;

    for attempt in 0..retry.max_attempts {
        match api.create_assignment(&assignment).await {
            Ok(_) => return Ok(build),
            Err(err) if err.is_transient() => {
                if attempt + 1 < retry.max_attempts {
                    warn!(build = %build, attempt, error = %err, "transient create failure, backing off");
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                last_transient = Some(err);
            }
            Err(err) => return Err((build, err)),
        }
    }

    let err = last_transient.expect("retry loop captures the last transient error");
    Err((build, err))
}

// --- run reports ----------------------------------------------------------

/// Write `run_summary.json` and `summary.md` under
/// `<reports_dir>/<run_id>/`.
pub async fn write_run_report(
    reports_dir: &Path,
    summary: &RunSummary,
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    tokio::fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    tokio::fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    tokio::fs::write(run_dir.join("summary.md"), summary.render_markdown())
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

/// Render the most recent `runs` report directories as markdown.
pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> anyhow::Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# AMR Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- target months: {}", summary.months_display()));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!("- succeeded: {}", summary.succeeded.len()));
        lines.push(format!("- failed: {}", summary.failed.len()));
        lines.push(format!(
            "- skipped: {} incomplete, {} duplicate, {} aborted",
            summary.skipped_incomplete.len(),
            summary.skipped_duplicate.len(),
            summary.skipped_aborted.len()
        ));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amr_core::VatStatus;
    use chrono::TimeZone;

    fn month(year: i32, m: u32) -> TaxMonth {
        TaxMonth::new(year, m).unwrap()
    }

    fn client(build: &str, vat: VatStatus) -> ClientRecord {
        ClientRecord {
            build: build.to_string(),
            company_name: format!("{build} Co"),
            legal_entity_no: format!("LE-{build}"),
            vat_status: vat,
            company_status: CompanyStatus::MonthlyActive,
        }
    }

    fn record(build: &str, m: TaxMonth, roles: RoleAssignments) -> AssignmentRecord {
        AssignmentRecord {
            id: Uuid::new_v4(),
            build: build.to_string(),
            month: m,
            roles,
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap(),
        }
    }

    fn roles_with(role: Role, employee: &str) -> RoleAssignments {
        let mut roles = RoleAssignments::default();
        roles.set(role, Some(EmployeeId::from(employee)));
        roles
    }

    fn snapshot(records: Vec<AssignmentRecord>) -> HashMap<BuildCode, AssignmentRecord> {
        records
            .into_iter()
            .map(|r| (r.build.clone(), r))
            .collect()
    }

    #[test]
    fn fresh_preview_defaults_everything_to_null() {
        let roster = vec![
            client("B-001", VatStatus::Registered),
            client("B-002", VatStatus::NotRegistered),
        ];
        let rows = build_preview(
            &roster,
            &HashMap::new(),
            &HashMap::new(),
            &EditMap::new(),
            month(2026, 8),
        );

        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(!row.is_assigned);
            assert!(row.new.is_empty());
            assert!(row.previous.is_empty());
            assert!(!row.is_complete());
        }
    }

    #[test]
    fn previous_month_values_carry_forward() {
        let roster = vec![client("B-001", VatStatus::Registered)];
        let previous = snapshot(vec![record(
            "B-001",
            month(2026, 7),
            roles_with(Role::Accounting, "E1"),
        )]);
        let rows = build_preview(
            &roster,
            &previous,
            &HashMap::new(),
            &EditMap::new(),
            month(2026, 8),
        );

        assert!(!rows[0].is_assigned);
        assert_eq!(
            rows[0].new.get(Role::Accounting),
            Some(&EmployeeId::from("E1"))
        );
        assert_eq!(
            rows[0].previous.get(Role::Accounting),
            Some(&EmployeeId::from("E1"))
        );
    }

    #[test]
    fn existing_target_assignment_beats_carry_forward() {
        let roster = vec![client("B-001", VatStatus::Registered)];
        let previous = snapshot(vec![record(
            "B-001",
            month(2026, 7),
            roles_with(Role::Accounting, "E1"),
        )]);
        let target = snapshot(vec![record(
            "B-001",
            month(2026, 8),
            roles_with(Role::Accounting, "E2"),
        )]);
        let rows = build_preview(&roster, &previous, &target, &EditMap::new(), month(2026, 8));

        assert!(rows[0].is_assigned);
        assert_eq!(
            rows[0].new.get(Role::Accounting),
            Some(&EmployeeId::from("E2"))
        );
        // Previous stays visible for comparison even when target wins.
        assert_eq!(
            rows[0].previous.get(Role::Accounting),
            Some(&EmployeeId::from("E1"))
        );
        // The target record fully replaces carry-forward, so a role the
        // target leaves empty stays empty.
        assert_eq!(rows[0].new.get(Role::TaxInspection), None);
    }

    #[test]
    fn user_edits_always_win_and_rebuilds_are_idempotent() {
        let roster = vec![client("B-001", VatStatus::Registered)];
        let previous = snapshot(vec![record(
            "B-001",
            month(2026, 7),
            roles_with(Role::Accounting, "E1"),
        )]);
        let target = snapshot(vec![record(
            "B-001",
            month(2026, 8),
            roles_with(Role::Accounting, "E2"),
        )]);
        let mut edits = EditMap::new();
        edits
            .entry("B-001".to_string())
            .or_default()
            .insert(Role::Accounting, EmployeeId::from("E3"));

        let first = build_preview(&roster, &previous, &target, &edits, month(2026, 8));
        assert_eq!(
            first[0].new.get(Role::Accounting),
            Some(&EmployeeId::from("E3"))
        );

        let second = build_preview(&roster, &previous, &target, &edits, month(2026, 8));
        assert_eq!(first, second);
    }

    #[test]
    fn validation_partitions_by_vat_aware_completeness() {
        let mut complete_row = build_preview(
            &[client("B-001", VatStatus::NotRegistered)],
            &HashMap::new(),
            &HashMap::new(),
            &EditMap::new(),
            month(2026, 8),
        )
        .remove(0);
        for role in [
            Role::Accounting,
            Role::TaxInspection,
            Role::WithholdingFiler,
            Role::DocumentEntry,
        ] {
            complete_row.new.set(role, Some(EmployeeId::from("E1")));
        }

        let incomplete_row = build_preview(
            &[client("B-002", VatStatus::Registered)],
            &HashMap::new(),
            &HashMap::new(),
            &EditMap::new(),
            month(2026, 8),
        )
        .remove(0);

        let (complete, incomplete) =
            BulkSaveExecutor::validate(&[complete_row, incomplete_row]);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].build, "B-001");
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].build, "B-002");
        assert!(incomplete[0].missing.contains(&Role::VatFiler));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
    }

    #[test]
    fn config_yaml_overrides_defaults() {
        let config: PipelineConfig =
            serde_yaml::from_str("base_url: http://office.example/api\nbatch_size: 2\n").unwrap();
        assert_eq!(config.base_url, "http://office.example/api");
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.inter_batch_delay_ms, 300);
        assert_eq!(config.retry_policy().base_delay, Duration::from_secs(1));
    }

    #[test]
    fn summary_markdown_lists_failed_rows() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            target_months: vec![month(2026, 8)],
            started_at: Utc::now(),
            finished_at: Utc::now(),
            succeeded: vec!["B-001".to_string()],
            failed: vec![RowFailure {
                build: "B-002".to_string(),
                error: "backend call failed: boom".to_string(),
            }],
            skipped_incomplete: vec![],
            skipped_duplicate: vec![],
            skipped_aborted: vec![],
        };
        let markdown = summary.render_markdown();
        assert!(markdown.contains("Target months: 2026-08"));
        assert!(markdown.contains("Succeeded: 1"));
        assert!(markdown.contains("## Failed Rows"));
        assert!(markdown.contains("B-002"));
    }

    #[test]
    fn disabled_vat_filer_slot_rejects_defaults_and_edits() {
        let roster = vec![client("B-001", VatStatus::NotRegistered)];
        let mut previous_roles = RoleAssignments::default();
        for role in Role::ALL {
            previous_roles.set(role, Some(EmployeeId::from("E1")));
        }
        let previous = snapshot(vec![record("B-001", month(2026, 7), previous_roles)]);

        let mut edits = EditMap::new();
        edits
            .entry("B-001".to_string())
            .or_default()
            .insert(Role::VatFiler, EmployeeId::from("E9"));

        let rows = build_preview(&roster, &previous, &HashMap::new(), &edits, month(2026, 8));
        assert_eq!(rows[0].new.get(Role::VatFiler), None);
        // Carry-forward still fills the enabled slots.
        assert_eq!(
            rows[0].new.get(Role::Accounting),
            Some(&EmployeeId::from("E1"))
        );
        // The reference value stays visible for comparison only.
        assert_eq!(
            rows[0].previous.get(Role::VatFiler),
            Some(&EmployeeId::from("E1"))
        );
    }
}
