//! Back-office API contract for AMR: the async trait the pipeline is
//! injected with, its error taxonomy, a reqwest implementation, and an
//! in-memory double for tests and fixture-driven runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info_span;
use uuid::Uuid;

use amr_core::{
    AssignmentRecord, BuildCode, ClientRecord, EmployeeRef, NewAssignment, Role, StatusFilter,
    TaxMonth,
};

pub const CRATE_NAME: &str = "amr-api";

/// Failure taxonomy for back-office calls. `Transient` is the only
/// variant the commit phase retries.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("transient backend failure: {message}")]
    Transient { message: String },
    #[error("backend call failed: {message}")]
    Permanent { message: String },
    #[error("backend rejected request: {message}")]
    Validation { message: String },
}

impl ApiError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// The five collaborator operations the reconciliation pipeline
/// consumes. Implementations must be shareable across concurrent
/// per-row create calls.
#[async_trait]
pub trait BackOfficeApi: Send + Sync {
    /// Clients whose company status matches the filter.
    async fn list_clients(&self, filter: &StatusFilter) -> Result<Vec<ClientRecord>, ApiError>;

    /// Batch lookup of the assignment records for `month`, restricted
    /// to `builds`. Builds without a record are simply absent from the
    /// result.
    async fn assignments_for_month(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError>;

    /// Existing records that would collide with a create at
    /// (build, month) for any of `builds`.
    async fn find_duplicate_assignments(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError>;

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<AssignmentRecord, ApiError>;

    async fn list_employees_by_role(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<EmployeeRef>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// JSON client against the back-office REST service. Never retries
/// internally; retry ownership sits with the commit phase, per row.
#[derive(Debug)]
pub struct RestBackOffice {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MonthLookupRequest<'a> {
    builds: &'a [BuildCode],
    year: i32,
    month: u32,
}

impl RestBackOffice {
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let url = response.url().to_string();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| ApiError::permanent(format!("decoding {url}: {err}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ApiError::validation(body));
        }
        let message = format!("http status {status} for {url}: {body}");
        match classify_status(status) {
            RetryDisposition::Retryable => Err(ApiError::transient(message)),
            RetryDisposition::NonRetryable => Err(ApiError::permanent(message)),
        }
    }

    fn map_send_error(err: reqwest::Error) -> ApiError {
        match classify_request_error(&err) {
            RetryDisposition::Retryable => ApiError::transient(err.to_string()),
            RetryDisposition::NonRetryable => ApiError::permanent(err.to_string()),
        }
    }

    async fn post_month_lookup(
        &self,
        path: &str,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError> {
        let request = MonthLookupRequest {
            builds,
            year: month.year,
            month: month.month,
        };
        let response = self
            .client
            .post(self.url(path))
            .json(&request)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::decode(response).await
    }
}

#[async_trait]
impl BackOfficeApi for RestBackOffice {
    async fn list_clients(&self, filter: &StatusFilter) -> Result<Vec<ClientRecord>, ApiError> {
        let span = info_span!("list_clients");
        let _guard = span.enter();

        let mut request = self.client.get(self.url("/clients"));
        if let StatusFilter::Any(statuses) = filter {
            let statuses = statuses
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            request = request.query(&[("status", statuses)]);
        }
        let response = request.send().await.map_err(Self::map_send_error)?;
        Self::decode(response).await
    }

    async fn assignments_for_month(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError> {
        let span = info_span!("assignments_for_month", %month);
        let _guard = span.enter();
        self.post_month_lookup("/assignments/lookup", builds, month)
            .await
    }

    async fn find_duplicate_assignments(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError> {
        let span = info_span!("find_duplicate_assignments", %month);
        let _guard = span.enter();
        self.post_month_lookup("/assignments/duplicates", builds, month)
            .await
    }

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<AssignmentRecord, ApiError> {
        let span = info_span!("create_assignment", build = %assignment.build, month = %assignment.month);
        let _guard = span.enter();

        let response = self
            .client
            .post(self.url("/assignments"))
            .json(assignment)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::decode(response).await
    }

    async fn list_employees_by_role(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<EmployeeRef>, ApiError> {
        let mut request = self.client.get(self.url("/employees"));
        if let Some(role) = role {
            request = request.query(&[("role", role.as_str())]);
        }
        let response = request.send().await.map_err(Self::map_send_error)?;
        Self::decode(response).await
    }
}

/// Seed data for [`InMemoryBackOffice`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiFixture {
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    #[serde(default)]
    pub assignments: Vec<AssignmentRecord>,
    #[serde(default)]
    pub employees: Vec<EmployeeRef>,
}

impl ApiFixture {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Permanent,
}

#[derive(Debug)]
struct FailurePlan {
    kind: InjectedFailure,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    clients: Vec<ClientRecord>,
    assignments: HashMap<(BuildCode, TaxMonth), AssignmentRecord>,
    employees: Vec<EmployeeRef>,
    fail_create: HashMap<BuildCode, FailurePlan>,
    create_calls: Vec<BuildCode>,
}

/// In-memory stand-in for the back office. Enforces the one-record-per
/// (build, month) invariant, supports per-build failure injection, and
/// tracks the peak number of concurrent create calls.
#[derive(Debug, Default)]
pub struct InMemoryBackOffice {
    state: Mutex<MemoryState>,
    create_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryBackOffice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: ApiFixture) -> Self {
        let office = Self::new();
        {
            let mut state = office.state.lock().expect("memory state lock");
            state.clients = fixture.clients;
            state.employees = fixture.employees;
            for record in fixture.assignments {
                state
                    .assignments
                    .insert((record.build.clone(), record.month), record);
            }
        }
        office
    }

    /// Hold each create call open for `delay` so batch overlap is
    /// observable in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make the next `times` creates for `build` fail with `kind`.
    pub fn fail_create(&self, build: impl Into<BuildCode>, kind: InjectedFailure, times: usize) {
        let mut state = self.state.lock().expect("memory state lock");
        state.fail_create.insert(
            build.into(),
            FailurePlan {
                kind,
                remaining: times,
            },
        );
    }

    /// Every build a create call was issued for, in call order
    /// (including failed attempts).
    pub fn create_calls(&self) -> Vec<BuildCode> {
        self.state
            .lock()
            .expect("memory state lock")
            .create_calls
            .clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn assignment(&self, build: &str, month: TaxMonth) -> Option<AssignmentRecord> {
        self.state
            .lock()
            .expect("memory state lock")
            .assignments
            .get(&(build.to_string(), month))
            .cloned()
    }

    pub fn assignment_count(&self) -> usize {
        self.state.lock().expect("memory state lock").assignments.len()
    }
}

#[async_trait]
impl BackOfficeApi for InMemoryBackOffice {
    async fn list_clients(&self, filter: &StatusFilter) -> Result<Vec<ClientRecord>, ApiError> {
        let state = self.state.lock().expect("memory state lock");
        Ok(state
            .clients
            .iter()
            .filter(|client| filter.matches(client.company_status))
            .cloned()
            .collect())
    }

    async fn assignments_for_month(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError> {
        let state = self.state.lock().expect("memory state lock");
        Ok(builds
            .iter()
            .filter_map(|build| state.assignments.get(&(build.clone(), month)).cloned())
            .collect())
    }

    async fn find_duplicate_assignments(
        &self,
        builds: &[BuildCode],
        month: TaxMonth,
    ) -> Result<Vec<AssignmentRecord>, ApiError> {
        self.assignments_for_month(builds, month).await
    }

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<AssignmentRecord, ApiError> {
        let planned_failure = {
            let mut state = self.state.lock().expect("memory state lock");
            state.create_calls.push(assignment.build.clone());
            match state.fail_create.get_mut(&assignment.build) {
                Some(plan) if plan.remaining > 0 => {
                    plan.remaining -= 1;
                    Some(plan.kind)
                }
                _ => None,
            }
        };

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        match self.create_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(kind) = planned_failure {
            return Err(match kind {
                InjectedFailure::Transient => {
                    ApiError::transient(format!("injected timeout for {}", assignment.build))
                }
                InjectedFailure::Permanent => {
                    ApiError::permanent(format!("injected rejection for {}", assignment.build))
                }
            });
        }

        let mut state = self.state.lock().expect("memory state lock");
        let key = (assignment.build.clone(), assignment.month);
        if state.assignments.contains_key(&key) {
            return Err(ApiError::validation(format!(
                "assignment already exists for {} at {}",
                assignment.build, assignment.month
            )));
        }

        let record = AssignmentRecord {
            id: Uuid::new_v4(),
            build: assignment.build.clone(),
            month: assignment.month,
            roles: assignment.roles.clone(),
            created_at: Utc::now(),
        };
        state.assignments.insert(key, record.clone());
        Ok(record)
    }

    async fn list_employees_by_role(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<EmployeeRef>, ApiError> {
        let state = self.state.lock().expect("memory state lock");
        Ok(state
            .employees
            .iter()
            .filter(|employee| role.is_none_or(|role| employee.roles.contains(&role)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amr_core::{CompanyStatus, EmployeeId, RoleAssignments, VatStatus};

    fn client(build: &str, status: CompanyStatus) -> ClientRecord {
        ClientRecord {
            build: build.to_string(),
            company_name: format!("{build} Co"),
            legal_entity_no: format!("LE-{build}"),
            vat_status: VatStatus::Registered,
            company_status: status,
        }
    }

    fn new_assignment(build: &str, month: TaxMonth) -> NewAssignment {
        let mut roles = RoleAssignments::default();
        roles.set(Role::Accounting, Some(EmployeeId::from("E1")));
        NewAssignment {
            build: build.to_string(),
            month,
            roles,
        }
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn memory_office_filters_clients_by_status() {
        let office = InMemoryBackOffice::from_fixture(ApiFixture {
            clients: vec![
                client("B-001", CompanyStatus::MonthlyActive),
                client("B-002", CompanyStatus::Cancelled),
            ],
            ..Default::default()
        });

        let active = office
            .list_clients(&StatusFilter::any([CompanyStatus::MonthlyActive]))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].build, "B-001");

        let all = office.list_clients(&StatusFilter::All).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn memory_office_rejects_duplicate_create() {
        let office = InMemoryBackOffice::new();
        let month = TaxMonth::new(2026, 8).unwrap();

        office
            .create_assignment(&new_assignment("B-001", month))
            .await
            .unwrap();
        let err = office
            .create_assignment(&new_assignment("B-001", month))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));

        // Same build, different month is a distinct identity.
        office
            .create_assignment(&new_assignment("B-001", month.previous()))
            .await
            .unwrap();
        assert_eq!(office.assignment_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let office = InMemoryBackOffice::new();
        let month = TaxMonth::new(2026, 8).unwrap();
        office.fail_create("B-001", InjectedFailure::Transient, 2);

        let first = office
            .create_assignment(&new_assignment("B-001", month))
            .await
            .unwrap_err();
        assert!(first.is_transient());
        let second = office
            .create_assignment(&new_assignment("B-001", month))
            .await
            .unwrap_err();
        assert!(second.is_transient());

        office
            .create_assignment(&new_assignment("B-001", month))
            .await
            .unwrap();
        assert_eq!(office.create_calls().len(), 3);
    }

    #[tokio::test]
    async fn employees_filter_by_role() {
        let office = InMemoryBackOffice::from_fixture(ApiFixture {
            employees: vec![
                EmployeeRef {
                    id: EmployeeId::from("E1"),
                    display_name: "Amara".to_string(),
                    roles: vec![Role::Accounting, Role::VatFiler],
                },
                EmployeeRef {
                    id: EmployeeId::from("E2"),
                    display_name: "Boon".to_string(),
                    roles: vec![Role::DocumentEntry],
                },
            ],
            ..Default::default()
        });

        let vat_filers = office
            .list_employees_by_role(Some(Role::VatFiler))
            .await
            .unwrap();
        assert_eq!(vat_filers.len(), 1);
        assert_eq!(vat_filers[0].id, EmployeeId::from("E1"));

        let all = office.list_employees_by_role(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn fixture_parses_with_missing_sections() {
        let fixture: ApiFixture = serde_json::from_str(r#"{"clients": []}"#).unwrap();
        assert!(fixture.clients.is_empty());
        assert!(fixture.assignments.is_empty());
        assert!(fixture.employees.is_empty());
    }
}
