use crate::scoring::{PropertyType, RiskLevel};
use crate::validation::{
    is_valid_email, is_valid_postal_code, normalize_phone, normalize_postal_code, normalize_token,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Enums ============

/// Lead lifecycle status. The string values are a persisted contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    New,
    Validated,
    Assigned,
    Sent,
    Accepted,
    Sold,
    Lost,
    Deleted,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 8] = [
        LeadStatus::New,
        LeadStatus::Validated,
        LeadStatus::Assigned,
        LeadStatus::Sent,
        LeadStatus::Accepted,
        LeadStatus::Sold,
        LeadStatus::Lost,
        LeadStatus::Deleted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Validated => "validated",
            LeadStatus::Assigned => "assigned",
            LeadStatus::Sent => "sent",
            LeadStatus::Accepted => "accepted",
            LeadStatus::Sold => "sold",
            LeadStatus::Lost => "lost",
            LeadStatus::Deleted => "deleted",
        }
    }

    /// Accepted, sold or deleted. Closed leads keep their providers and attribution.
    pub const fn is_closed(self) -> bool {
        matches!(
            self,
            LeadStatus::Accepted | LeadStatus::Sold | LeadStatus::Deleted
        )
    }

    pub const fn locks_collaborator(self) -> bool {
        self.is_closed()
    }

    pub const fn allows_provider_reassignment(self) -> bool {
        !self.is_closed()
    }

    /// Status a lead moves to after providers were (re)assigned to it.
    pub const fn after_assignment(self) -> LeadStatus {
        match self {
            LeadStatus::Sent | LeadStatus::Lost => self,
            _ => LeadStatus::Assigned,
        }
    }

    /// Status a lead moves to after an automatic re-run found no provider.
    pub const fn after_empty_assignment(self) -> LeadStatus {
        match self {
            LeadStatus::New | LeadStatus::Validated | LeadStatus::Assigned => {
                LeadStatus::Validated
            }
            _ => self,
        }
    }
}

impl FromStr for LeadStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value.trim())
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "status",
                value: value.to_string(),
            })
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    #[default]
    Auto,
    Manual,
}

impl AssignmentMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            AssignmentMode::Auto => "auto",
            AssignmentMode::Manual => "manual",
        }
    }
}

impl FromStr for AssignmentMode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(AssignmentMode::Auto),
            "manual" => Ok(AssignmentMode::Manual),
            other => Err(ValidationError::InvalidValue {
                field: "assignment_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Purchase horizon declared by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentPlazo {
    #[serde(rename = "esta_semana")]
    ThisWeek,
    #[serde(rename = "1_3_meses")]
    OneToThreeMonths,
    #[serde(rename = "informativo")]
    Informational,
}

impl IntentPlazo {
    pub const fn as_str(self) -> &'static str {
        match self {
            IntentPlazo::ThisWeek => "esta_semana",
            IntentPlazo::OneToThreeMonths => "1_3_meses",
            IntentPlazo::Informational => "informativo",
        }
    }

    /// Unknown horizons are dropped rather than rejected.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "esta_semana" => Some(IntentPlazo::ThisWeek),
            "1_3_meses" => Some(IntentPlazo::OneToThreeMonths),
            "informativo" => Some(IntentPlazo::Informational),
            _ => None,
        }
    }

    const fn score_adjustment(self) -> i64 {
        match self {
            IntentPlazo::ThisWeek => 10,
            IntentPlazo::OneToThreeMonths => 5,
            IntentPlazo::Informational => -30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorStatus {
    #[default]
    Active,
    Paused,
    Banned,
}

impl CollaboratorStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            CollaboratorStatus::Active => "active",
            CollaboratorStatus::Paused => "paused",
            CollaboratorStatus::Banned => "banned",
        }
    }
}

impl FromStr for CollaboratorStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "active" => Ok(CollaboratorStatus::Active),
            "paused" => Ok(CollaboratorStatus::Paused),
            "banned" => Ok(CollaboratorStatus::Banned),
            other => Err(ValidationError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionType {
    #[default]
    Percent,
    Fixed,
}

impl CommissionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommissionType::Percent => "percent",
            CommissionType::Fixed => "fixed",
        }
    }
}

impl FromStr for CommissionType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "percent" => Ok(CommissionType::Percent),
            "fixed" => Ok(CommissionType::Fixed),
            other => Err(ValidationError::InvalidValue {
                field: "commission_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Rejections raised by the validating constructors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),
    #[error("invalid email address")]
    InvalidEmail,
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("postal_code must be 5 digits")]
    InvalidPostalCode,
    #[error("consent must be accepted")]
    ConsentRequired,
    #[error("assigned_provider_id {0} is not one of provider_ids")]
    UnknownAssignedProvider(String),
    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

/// Accepts either a JSON array of strings or a single comma-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    Many(Vec<String>),
    Joined(String),
}

impl StringList {
    pub fn into_vec(self) -> Vec<String> {
        let items = match self {
            StringList::Many(items) => items,
            StringList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

impl From<Vec<&str>> for StringList {
    fn from(items: Vec<&str>) -> Self {
        StringList::Many(items.into_iter().map(str::to_string).collect())
    }
}

fn dedupe(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============ Pricing ============

/// Commercial derivations computed when a lead is created.
pub mod pricing {
    use super::IntentPlazo;
    use crate::scoring::{PropertyType, RiskLevel};
    use serde_json::Value;

    /// Priority score sold to providers: the risk score nudged by purchase intent.
    pub fn lead_score(risk_score: Option<f64>, intent: Option<IntentPlazo>) -> i64 {
        let base = risk_score.unwrap_or(0.0).round() as i64;
        let adjusted = base + intent.map(IntentPlazo::score_adjustment).unwrap_or(0);
        adjusted.max(0)
    }

    /// The evaluation summary as a JSON object. Clients send it either as an
    /// object or as a JSON-encoded string; anything else yields `None`.
    pub fn parsed_summary(evaluation_summary: Option<&Value>) -> Option<Value> {
        match evaluation_summary? {
            Value::Object(_) => evaluation_summary.cloned(),
            Value::String(text) => serde_json::from_str::<Value>(text.trim())
                .ok()
                .filter(Value::is_object),
            _ => None,
        }
    }

    /// A lead is priced as `comercio` when either the declared business type
    /// or the evaluated property type says so.
    pub fn pricing_type(business_type: &str, evaluation_summary: Option<&Value>) -> PropertyType {
        let evaluated = parsed_summary(evaluation_summary)
            .as_ref()
            .and_then(|summary| summary.get("tipo_inmueble"))
            .and_then(Value::as_str)
            .map(|v| v.trim().to_lowercase());
        if business_type == "comercio" || evaluated.as_deref() == Some("comercio") {
            PropertyType::Comercio
        } else {
            PropertyType::Vivienda
        }
    }

    pub fn ticket_estimated_eur(pricing_type: PropertyType, level: RiskLevel) -> i64 {
        match (pricing_type, level) {
            (PropertyType::Comercio, RiskLevel::High | RiskLevel::Critical) => 1200,
            (PropertyType::Comercio, RiskLevel::Low) => 600,
            (PropertyType::Comercio, RiskLevel::Medium) => 900,
            (PropertyType::Vivienda, RiskLevel::High | RiskLevel::Critical) => 900,
            (PropertyType::Vivienda, RiskLevel::Low) => 450,
            (PropertyType::Vivienda, RiskLevel::Medium) => 650,
        }
    }

    pub fn price_eur(pricing_type: PropertyType, level: RiskLevel) -> i64 {
        match (pricing_type, level) {
            (PropertyType::Comercio, RiskLevel::High | RiskLevel::Critical) => 70,
            (PropertyType::Comercio, RiskLevel::Low) => 20,
            (PropertyType::Comercio, RiskLevel::Medium) => 35,
            (PropertyType::Vivienda, RiskLevel::High | RiskLevel::Critical) => 45,
            (PropertyType::Vivienda, RiskLevel::Low) => 15,
            (PropertyType::Vivienda, RiskLevel::Medium) => 25,
        }
    }
}

// ============ Lead ============

/// One submission routed to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub email: String,
    /// E.164, empty once anonymized.
    pub phone: String,
    pub city: String,
    pub postal_code: String,
    pub business_type: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_score: Option<f64>,
    pub urgency: String,
    pub budget_range: String,
    #[serde(default)]
    pub intent_plazo: Option<IntentPlazo>,
    pub lead_score: i64,
    pub ticket_estimated_eur: i64,
    pub price_eur: i64,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub evaluation_summary: Option<Value>,
    pub status: LeadStatus,
    #[serde(default)]
    pub provider_ids: Vec<String>,
    #[serde(default)]
    pub assigned_provider_id: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignment_mode: AssignmentMode,
    #[serde(default)]
    pub assigned_by: Option<String>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sold_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub consent: bool,
    #[serde(default)]
    pub consent_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consent_ip: Option<String>,
    #[serde(default)]
    pub collaborator_id: Option<String>,
    #[serde(default)]
    pub collaborator_tracking_code: Option<String>,
    #[serde(default)]
    pub commission_estimated_eur: Option<i64>,
}

/// Raw lead fields as submitted by the public form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub business_type: Option<String>,
    pub risk_level: Option<String>,
    pub risk_score: Option<f64>,
    pub urgency: Option<String>,
    pub budget_range: Option<String>,
    pub intent_plazo: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub consent: bool,
    pub consent_timestamp: Option<DateTime<Utc>>,
    pub evaluation_summary: Option<Value>,
    /// Collaborator tracking code carried by referral links.
    #[serde(alias = "ref")]
    pub tracking_code: Option<String>,
}

/// Collaborator resolved by the caller before the lead is created.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub collaborator_id: String,
    pub tracking_code: String,
}

/// Request-scoped facts that are not part of the submitted form.
#[derive(Debug, Clone)]
pub struct CreateContext {
    pub ip: Option<String>,
    pub now: DateTime<Utc>,
    pub attribution: Option<Attribution>,
}

impl CreateContext {
    pub fn new(ip: Option<String>) -> Self {
        Self {
            ip,
            now: Utc::now(),
            attribution: None,
        }
    }
}

/// Partial update applied through [`Lead::apply_patch`].
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct LeadPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub business_type: Option<String>,
    pub notes: Option<String>,
    pub status: Option<LeadStatus>,
    pub provider_ids: Option<Vec<String>>,
    pub assigned_provider_id: Option<Option<String>>,
    pub assigned_at: Option<Option<DateTime<Utc>>>,
    pub assignment_mode: Option<AssignmentMode>,
    pub assigned_by: Option<Option<String>>,
    pub collaborator_id: Option<Option<String>>,
    pub collaborator_tracking_code: Option<Option<String>>,
    pub commission_estimated_eur: Option<Option<i64>>,
}

impl LeadPatch {
    pub fn status(status: LeadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl Lead {
    /// Build a new lead in status `new` from submitted fields.
    pub fn from_input(input: LeadInput, ctx: CreateContext) -> Result<Lead, ValidationError> {
        let name = trimmed(input.name).ok_or(ValidationError::Required("name"))?;
        let email = trimmed(input.email)
            .map(|e| e.to_lowercase())
            .ok_or(ValidationError::Required("email"))?;
        let phone_raw = trimmed(input.phone).ok_or(ValidationError::Required("phone"))?;
        let phone = normalize_phone(&phone_raw).ok_or(ValidationError::InvalidPhone)?;
        let city = trimmed(input.city).ok_or(ValidationError::Required("city"))?;
        let postal_code = input
            .postal_code
            .as_deref()
            .map(normalize_postal_code)
            .filter(|code| !code.is_empty())
            .ok_or(ValidationError::Required("postal_code"))?;

        let business_type = trimmed(input.business_type)
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "general".to_string());
        let risk_level = input
            .risk_level
            .as_deref()
            .and_then(RiskLevel::parse_lenient)
            .unwrap_or(RiskLevel::Medium);
        let risk_score = input
            .risk_score
            .or_else(|| {
                pricing::parsed_summary(input.evaluation_summary.as_ref())
                    .as_ref()
                    .and_then(|summary| summary.get("risk_score"))
                    .and_then(Value::as_f64)
            })
            .filter(|score| score.is_finite())
            .map(|score| score.clamp(0.0, 100.0));
        let intent_plazo = input.intent_plazo.as_deref().and_then(IntentPlazo::parse_lenient);

        let pricing_type = pricing::pricing_type(&business_type, input.evaluation_summary.as_ref());
        let (collaborator_id, collaborator_tracking_code) = match ctx.attribution {
            Some(a) => (Some(a.collaborator_id), Some(a.tracking_code)),
            None => (None, None),
        };

        let lead = Lead {
            id: Uuid::new_v4().to_string(),
            created_at: ctx.now,
            name,
            email,
            phone,
            city,
            postal_code,
            business_type,
            risk_level,
            risk_score,
            urgency: trimmed(input.urgency)
                .map(|u| u.to_lowercase())
                .unwrap_or_else(|| "media".to_string()),
            budget_range: trimmed(input.budget_range)
                .map(|b| b.to_lowercase())
                .unwrap_or_else(|| "sin_definir".to_string()),
            intent_plazo,
            lead_score: pricing::lead_score(risk_score, intent_plazo),
            ticket_estimated_eur: pricing::ticket_estimated_eur(pricing_type, risk_level),
            price_eur: pricing::price_eur(pricing_type, risk_level),
            notes: input.notes.unwrap_or_default(),
            evaluation_summary: input.evaluation_summary,
            status: LeadStatus::New,
            provider_ids: Vec::new(),
            assigned_provider_id: None,
            assigned_at: None,
            assignment_mode: AssignmentMode::Auto,
            assigned_by: None,
            accepted_at: None,
            sold_at: None,
            updated_at: None,
            deleted_at: None,
            consent: input.consent,
            consent_timestamp: input
                .consent_timestamp
                .or(if input.consent { Some(ctx.now) } else { None }),
            consent_ip: ctx.ip,
            collaborator_id,
            collaborator_tracking_code,
            commission_estimated_eur: None,
        };

        lead.validate()?;
        Ok(lead)
    }

    /// Apply a patch and re-run validation. The receiver is left untouched on error.
    pub fn apply_patch(&self, patch: LeadPatch, now: DateTime<Utc>) -> Result<Lead, ValidationError> {
        let mut lead = self.clone();

        if let Some(name) = patch.name {
            lead.name = name.trim().to_string();
        }
        if let Some(email) = patch.email {
            lead.email = email.trim().to_lowercase();
        }
        if let Some(phone) = patch.phone {
            lead.phone = normalize_phone(&phone).ok_or(ValidationError::InvalidPhone)?;
        }
        if let Some(city) = patch.city {
            lead.city = city.trim().to_string();
        }
        if let Some(postal_code) = patch.postal_code {
            lead.postal_code = normalize_postal_code(&postal_code);
        }
        if let Some(business_type) = patch.business_type {
            lead.business_type =
                trimmed(Some(business_type)).map_or_else(|| "general".to_string(), |t| t.to_lowercase());
        }
        if let Some(notes) = patch.notes {
            lead.notes = notes;
        }
        if let Some(status) = patch.status {
            if status == LeadStatus::Accepted && lead.accepted_at.is_none() {
                lead.accepted_at = Some(now);
            }
            if status == LeadStatus::Sold && lead.sold_at.is_none() {
                lead.sold_at = Some(now);
            }
            if status == LeadStatus::Deleted && lead.deleted_at.is_none() {
                lead.deleted_at = Some(now);
            }
            lead.status = status;
        }
        if let Some(provider_ids) = patch.provider_ids {
            lead.provider_ids = dedupe(
                provider_ids
                    .into_iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty()),
            );
        }
        if let Some(assigned) = patch.assigned_provider_id {
            lead.assigned_provider_id = assigned;
        }
        if let Some(assigned_at) = patch.assigned_at {
            lead.assigned_at = assigned_at;
        }
        if let Some(mode) = patch.assignment_mode {
            lead.assignment_mode = mode;
        }
        if let Some(assigned_by) = patch.assigned_by {
            lead.assigned_by = assigned_by;
        }
        if let Some(collaborator_id) = patch.collaborator_id {
            lead.collaborator_id = collaborator_id;
        }
        if let Some(code) = patch.collaborator_tracking_code {
            lead.collaborator_tracking_code = code;
        }
        if let Some(commission) = patch.commission_estimated_eur {
            lead.commission_estimated_eur = commission;
        }

        lead.updated_at = Some(now);
        lead.validate()?;
        Ok(lead)
    }

    /// Scrub personal data and mark the lead deleted.
    pub fn anonymized(&self, reason: Option<&str>, now: DateTime<Utc>) -> Lead {
        let mut lead = self.clone();
        let suffix = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| format!(" {}", r))
            .unwrap_or_default();
        lead.notes = format!("{}\n[ANONYMIZED]{}", lead.notes, suffix);
        lead.name = "ANONIMIZADO".to_string();
        lead.email.clear();
        lead.phone.clear();
        lead.city.clear();
        lead.postal_code.clear();
        lead.consent_ip = None;
        lead.status = LeadStatus::Deleted;
        lead.deleted_at = Some(now);
        lead.updated_at = Some(now);
        lead
    }

    /// Checks every field invariant. Deleted leads are exempt.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(assigned) = &self.assigned_provider_id {
            if !self.provider_ids.contains(assigned) {
                return Err(ValidationError::UnknownAssignedProvider(assigned.clone()));
            }
        }

        if self.status == LeadStatus::Deleted {
            return Ok(());
        }

        if self.name.is_empty() {
            return Err(ValidationError::Required("name"));
        }
        if self.email.is_empty() {
            return Err(ValidationError::Required("email"));
        }
        if !is_valid_email(&self.email) {
            return Err(ValidationError::InvalidEmail);
        }
        if self.phone.is_empty() {
            return Err(ValidationError::Required("phone"));
        }
        if self.city.is_empty() {
            return Err(ValidationError::Required("city"));
        }
        if self.postal_code.is_empty() {
            return Err(ValidationError::Required("postal_code"));
        }
        if !is_valid_postal_code(&self.postal_code) {
            return Err(ValidationError::InvalidPostalCode);
        }
        if !self.consent {
            return Err(ValidationError::ConsentRequired);
        }

        Ok(())
    }

    pub fn pricing_type(&self) -> PropertyType {
        pricing::pricing_type(&self.business_type, self.evaluation_summary.as_ref())
    }

    /// Evaluation summary as plain text for notification bodies.
    pub fn evaluation_summary_text(&self) -> String {
        match &self.evaluation_summary {
            None | Some(Value::Null) => "No informado".to_string(),
            Some(Value::String(text)) if text.trim().is_empty() => "No informado".to_string(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }

    pub fn references_provider(&self, provider_id: &str) -> bool {
        self.assigned_provider_id.as_deref() == Some(provider_id)
            || self.provider_ids.iter().any(|id| id == provider_id)
    }
}

// ============ Provider ============

/// Service company eligible to receive leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    /// Normalized postal-code or city tokens. Empty matches any lead.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Normalized business types. Empty matches any lead.
    #[serde(default)]
    pub business_types: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: i32,
    #[serde(default)]
    pub last_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderInput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub zones: Option<StringList>,
    pub business_types: Option<StringList>,
    pub active: Option<bool>,
    pub priority: Option<i32>,
    pub daily_cap: Option<i32>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_PROVIDER_PRIORITY: i32 = 100;
pub const DEFAULT_DAILY_CAP: i32 = 10;

fn default_active() -> bool {
    true
}

fn default_priority() -> i32 {
    DEFAULT_PROVIDER_PRIORITY
}

fn default_daily_cap() -> i32 {
    DEFAULT_DAILY_CAP
}

impl Provider {
    /// Create a provider, or merge `input` over `existing` for updates.
    pub fn from_input(input: ProviderInput, existing: Option<&Provider>) -> Result<Provider, ValidationError> {
        let id = existing
            .map(|p| p.id.clone())
            .or_else(|| trimmed(input.id))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let name = input
            .name
            .or_else(|| existing.map(|p| p.name.clone()))
            .map(|n| n.trim().to_string())
            .unwrap_or_default();
        let email = input
            .email
            .or_else(|| existing.map(|p| p.email.clone()))
            .map(|e| e.trim().to_lowercase())
            .unwrap_or_default();
        let phone = input
            .phone
            .or_else(|| existing.map(|p| p.phone.clone()))
            .map(|p| p.trim().to_string())
            .unwrap_or_default();

        let zones = match input.zones {
            Some(list) => normalize_tokens(list.into_vec()),
            None => existing.map(|p| p.zones.clone()).unwrap_or_default(),
        };
        let business_types = match input.business_types {
            Some(list) => normalize_tokens(list.into_vec()),
            None => existing.map(|p| p.business_types.clone()).unwrap_or_default(),
        };

        if name.is_empty() {
            return Err(ValidationError::Required("name"));
        }
        if email.is_empty() {
            return Err(ValidationError::Required("email"));
        }
        if !is_valid_email(&email) {
            return Err(ValidationError::InvalidEmail);
        }

        Ok(Provider {
            id,
            name,
            email,
            phone,
            zones,
            business_types,
            active: input.active.or(existing.map(|p| p.active)).unwrap_or(true),
            priority: input
                .priority
                .or(existing.map(|p| p.priority))
                .unwrap_or(DEFAULT_PROVIDER_PRIORITY),
            daily_cap: input
                .daily_cap
                .or(existing.map(|p| p.daily_cap))
                .unwrap_or(DEFAULT_DAILY_CAP)
                .max(1),
            last_assigned_at: input
                .last_assigned_at
                .or(existing.and_then(|p| p.last_assigned_at)),
        })
    }
}

fn normalize_tokens(items: Vec<String>) -> Vec<String> {
    dedupe(
        items
            .iter()
            .map(|item| normalize_token(item))
            .filter(|item| !item.is_empty()),
    )
}

// ============ Collaborator ============

/// Referral partner credited for leads carrying its tracking code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub collaborator_type: String,
    pub tracking_code: String,
    pub commission_type: CommissionType,
    pub commission_value: f64,
    pub status: CollaboratorStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollaboratorInput {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub collaborator_type: Option<String>,
    pub tracking_code: Option<String>,
    pub commission_type: Option<String>,
    pub commission_value: Option<f64>,
    pub status: Option<String>,
}

impl Collaborator {
    pub fn from_input(
        input: CollaboratorInput,
        existing: Option<&Collaborator>,
        now: DateTime<Utc>,
    ) -> Result<Collaborator, ValidationError> {
        let name = trimmed(input.name)
            .or_else(|| existing.map(|c| c.name.clone()))
            .ok_or(ValidationError::Required("name"))?;
        let tracking_code = trimmed(input.tracking_code)
            .map(|code| code.to_uppercase())
            .or_else(|| existing.map(|c| c.tracking_code.clone()))
            .ok_or(ValidationError::Required("tracking_code"))?;
        let collaborator_type = trimmed(input.collaborator_type)
            .map(|t| t.to_lowercase())
            .or_else(|| existing.map(|c| c.collaborator_type.clone()))
            .unwrap_or_else(|| "partner".to_string());
        let commission_type = match input.commission_type {
            Some(raw) => raw.parse::<CommissionType>()?,
            None => existing.map(|c| c.commission_type).unwrap_or_default(),
        };
        let commission_value = input
            .commission_value
            .or(existing.map(|c| c.commission_value))
            .unwrap_or(0.0);
        if !commission_value.is_finite() || commission_value < 0.0 {
            return Err(ValidationError::InvalidValue {
                field: "commission_value",
                value: commission_value.to_string(),
            });
        }
        let status = match input.status {
            Some(raw) => raw.parse::<CollaboratorStatus>()?,
            None => existing.map(|c| c.status).unwrap_or_default(),
        };

        Ok(Collaborator {
            id: existing
                .map(|c| c.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name,
            collaborator_type,
            tracking_code,
            commission_type,
            commission_value,
            status,
            created_at: existing.map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == CollaboratorStatus::Active
    }

    pub fn attribution(&self) -> Attribution {
        Attribution {
            collaborator_id: self.id.clone(),
            tracking_code: self.tracking_code.clone(),
        }
    }

    /// Expected commission in whole euros for a lead of the given ticket.
    pub fn estimate_commission(&self, ticket_estimated_eur: i64) -> i64 {
        match self.commission_type {
            CommissionType::Percent => {
                (ticket_estimated_eur as f64 * self.commission_value / 100.0).round() as i64
            }
            CommissionType::Fixed => self.commission_value.round() as i64,
        }
    }
}

// ============ Events ============

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadEvent {
    pub id: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: Value,
}
