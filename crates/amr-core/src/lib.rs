//! Core domain model for AMR: clients, tax months, roles, and assignments.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "amr-core";

/// Unique business identifier for a client company.
pub type BuildCode = String;

/// A (year, month) tax period. Ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaxMonth {
    pub year: i32,
    pub month: u32,
}

impl TaxMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, InvalidTaxMonth> {
        if (1..=12).contains(&month) {
            Ok(Self { year, month })
        } else {
            Err(InvalidTaxMonth)
        }
    }

    /// The month immediately before this one; January rolls back to
    /// December of the prior year.
    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for TaxMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTaxMonth;

impl fmt::Display for InvalidTaxMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tax month must be formatted YYYY-MM with month 1..=12")
    }
}

impl std::error::Error for InvalidTaxMonth {}

impl FromStr for TaxMonth {
    type Err = InvalidTaxMonth;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s.split_once('-').ok_or(InvalidTaxMonth)?;
        let year: i32 = year.parse().map_err(|_| InvalidTaxMonth)?;
        let month: u32 = month.parse().map_err(|_| InvalidTaxMonth)?;
        Self::new(year, month)
    }
}

/// The five fixed responsible-party roles a client needs covered each
/// tax month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Accounting,
    TaxInspection,
    WithholdingFiler,
    VatFiler,
    DocumentEntry,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Accounting,
        Role::TaxInspection,
        Role::WithholdingFiler,
        Role::VatFiler,
        Role::DocumentEntry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Accounting => "accounting",
            Role::TaxInspection => "tax_inspection",
            Role::WithholdingFiler => "withholding_filer",
            Role::VatFiler => "vat_filer",
            Role::DocumentEntry => "document_entry",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown role `{s}`"))
    }
}

/// Employee identifier as issued by the back office.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub String);

impl EmployeeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EmployeeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeRef {
    pub id: EmployeeId,
    pub display_name: String,
    /// Roles this employee can be assigned to.
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    MonthlyActive,
    MonthlyDormant,
    MonthlyAnnualPay,
    MonthlyFinalMonth,
    Cancelled,
}

impl CompanyStatus {
    pub const ALL: [CompanyStatus; 5] = [
        CompanyStatus::MonthlyActive,
        CompanyStatus::MonthlyDormant,
        CompanyStatus::MonthlyAnnualPay,
        CompanyStatus::MonthlyFinalMonth,
        CompanyStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CompanyStatus::MonthlyActive => "monthly_active",
            CompanyStatus::MonthlyDormant => "monthly_dormant",
            CompanyStatus::MonthlyAnnualPay => "monthly_annual_pay",
            CompanyStatus::MonthlyFinalMonth => "monthly_final_month",
            CompanyStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CompanyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompanyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompanyStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown company status `{s}`"))
    }
}

/// Company-status selection for a roster load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusFilter {
    All,
    Any(BTreeSet<CompanyStatus>),
}

impl StatusFilter {
    pub fn any(statuses: impl IntoIterator<Item = CompanyStatus>) -> Self {
        Self::Any(statuses.into_iter().collect())
    }

    /// The concrete statuses the filter selects, in stable order.
    pub fn selected(&self) -> Vec<CompanyStatus> {
        match self {
            StatusFilter::All => CompanyStatus::ALL.to_vec(),
            StatusFilter::Any(set) => set.iter().copied().collect(),
        }
    }

    pub fn matches(&self, status: CompanyStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Any(set) => set.contains(&status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatStatus {
    Registered,
    NotRegistered,
    Unknown,
}

/// A client company as the back office reports it. Immutable within a
/// reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub build: BuildCode,
    pub company_name: String,
    pub legal_entity_no: String,
    pub vat_status: VatStatus,
    pub company_status: CompanyStatus,
}

/// The five responsible-party slots for one client's tax month.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignments {
    pub accounting: Option<EmployeeId>,
    pub tax_inspection: Option<EmployeeId>,
    pub withholding_filer: Option<EmployeeId>,
    pub vat_filer: Option<EmployeeId>,
    pub document_entry: Option<EmployeeId>,
}

impl RoleAssignments {
    pub fn get(&self, role: Role) -> Option<&EmployeeId> {
        match role {
            Role::Accounting => self.accounting.as_ref(),
            Role::TaxInspection => self.tax_inspection.as_ref(),
            Role::WithholdingFiler => self.withholding_filer.as_ref(),
            Role::VatFiler => self.vat_filer.as_ref(),
            Role::DocumentEntry => self.document_entry.as_ref(),
        }
    }

    pub fn set(&mut self, role: Role, employee: Option<EmployeeId>) {
        let slot = match role {
            Role::Accounting => &mut self.accounting,
            Role::TaxInspection => &mut self.tax_inspection,
            Role::WithholdingFiler => &mut self.withholding_filer,
            Role::VatFiler => &mut self.vat_filer,
            Role::DocumentEntry => &mut self.document_entry,
        };
        *slot = employee;
    }

    pub fn is_empty(&self) -> bool {
        Role::ALL.into_iter().all(|role| self.get(role).is_none())
    }
}

/// A persisted work assignment. At most one record exists per
/// (build, year, month); duplicates are skipped at save time, never
/// overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: Uuid,
    pub build: BuildCode,
    pub month: TaxMonth,
    pub roles: RoleAssignments,
    pub created_at: DateTime<Utc>,
}

/// Create payload for a new assignment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAssignment {
    pub build: BuildCode,
    pub month: TaxMonth,
    pub roles: RoleAssignments,
}

/// One editable row of a reconciliation session. `previous` is
/// display-only reference data; `new` is what a bulk save commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewRow {
    pub build: BuildCode,
    pub company_name: String,
    pub vat_status: VatStatus,
    pub company_status: CompanyStatus,
    pub target_month: TaxMonth,
    pub is_assigned: bool,
    pub previous: RoleAssignments,
    pub new: RoleAssignments,
}

impl PreviewRow {
    /// The VAT-filer slot only applies to VAT-registered clients; for
    /// the rest it is disabled outright, not merely optional.
    pub fn vat_filer_enabled(&self) -> bool {
        self.vat_status == VatStatus::Registered
    }

    pub fn required_roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| *role != Role::VatFiler || self.vat_filer_enabled())
            .collect()
    }

    pub fn missing_roles(&self) -> Vec<Role> {
        self.required_roles()
            .into_iter()
            .filter(|role| self.new.get(*role).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_roles().is_empty()
    }
}
