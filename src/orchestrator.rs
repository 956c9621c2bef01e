//! Lead submission pipeline and administrative lead operations.
//!
//! Submission runs create -> validate -> assign -> notify -> finalize.
//! Repository writes are fatal and abort the remaining steps without undoing
//! the ones already committed. Events and emails are best-effort: failures
//! are logged and the pipeline continues.
//!
//! Capacity and fairness state are read without cross-request locking, so
//! two concurrent submissions can pick the same provider past its daily cap.

use crate::assignment::select_providers;
use crate::events::{self, track_event, EventContext};
use crate::models::{
    AssignmentMode, CreateContext, Lead, LeadInput, LeadPatch, LeadStatus, Provider,
};
use crate::notifications::LeadNotifier;
use crate::repository::{Repositories, RepositoryError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

pub const DEFAULT_MAX_PROVIDERS_PER_LEAD: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("lead {0} not found")]
    LeadNotFound(String),
    #[error("provider {0} not found")]
    ProviderNotFound(String),
    #[error("providers not found: {}", .0.join(", "))]
    UnknownProviders(Vec<String>),
    #[error("no collaborator with tracking code {0}")]
    CollaboratorNotFound(String),
    #[error("collaborator {0} is not active")]
    CollaboratorInactive(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{action} is not allowed for lead {lead_id} in status {status}")]
    NotAllowed {
        lead_id: String,
        status: LeadStatus,
        action: &'static str,
    },
    #[error("provider {0} has assigned leads and cannot be deleted")]
    ProviderInUse(String),
    #[error("lead {0} disappeared while being processed")]
    LeadVanished(String),
}

/// A public lead submission.
#[derive(Debug, Clone)]
pub struct LeadSubmission {
    pub input: LeadInput,
    pub requester_ip: Option<String>,
    /// Whether the phone passed OTP verification for this requester.
    pub phone_verified: bool,
}

/// Lead state after a pipeline or assignment operation.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentOutcome {
    pub lead: Lead,
    pub assigned_providers: Vec<Provider>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsTotals {
    pub leads: usize,
    pub providers: usize,
    pub events: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub totals: MetricsTotals,
    pub leads_by_status: BTreeMap<String, usize>,
    pub events_by_name: BTreeMap<String, usize>,
}

/// Await a side effect whose failure must not stop the pipeline.
async fn best_effort<T, E, F>(step: &str, lead_id: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("{} failed for lead {} (continuing): {}", step, lead_id, e);
            None
        }
    }
}

#[derive(Clone)]
pub struct LeadOrchestrator {
    repos: Repositories,
    notifier: Arc<dyn LeadNotifier>,
    max_providers_per_lead: usize,
}

impl LeadOrchestrator {
    pub fn new(
        repos: Repositories,
        notifier: Arc<dyn LeadNotifier>,
        max_providers_per_lead: usize,
    ) -> Self {
        Self {
            repos,
            notifier,
            max_providers_per_lead: max_providers_per_lead.max(1),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn max_providers_per_lead(&self) -> usize {
        self.max_providers_per_lead
    }

    async fn apply(&self, lead_id: &str, patch: LeadPatch) -> Result<Lead, PipelineError> {
        self.repos
            .leads
            .update(lead_id, patch)
            .await?
            .ok_or_else(|| PipelineError::LeadVanished(lead_id.to_string()))
    }

    async fn load_lead(&self, lead_id: &str) -> Result<Lead, PipelineError> {
        self.repos
            .leads
            .get_by_id(lead_id)
            .await?
            .ok_or_else(|| PipelineError::LeadNotFound(lead_id.to_string()))
    }

    async fn record(&self, lead_id: &str, event_name: &str, payload: serde_json::Value, ctx: &EventContext) {
        best_effort(
            event_name,
            lead_id,
            track_event(self.repos.events.as_ref(), event_name, payload, ctx.to_value()),
        )
        .await;
    }

    async fn notify_providers(&self, providers: &[Provider], lead: &Lead) -> usize {
        let mut delivered = 0;
        for provider in providers {
            let sent = best_effort(
                "provider email",
                &lead.id,
                self.notifier.send_provider_lead_email(provider, lead),
            )
            .await;
            if sent.is_some() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Run the full submission pipeline for a new lead.
    pub async fn submit(&self, submission: LeadSubmission) -> Result<AssignmentOutcome, PipelineError> {
        let now = Utc::now();
        let LeadSubmission {
            input,
            requester_ip,
            phone_verified,
        } = submission;

        // 1. Create
        let collaborator = match input.tracking_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                match self.repos.collaborators.find_by_tracking_code(code).await? {
                    Some(c) if c.is_active() => Some(c),
                    Some(c) => {
                        tracing::info!("Ignoring tracking code {} (collaborator {} not active)", code, c.id);
                        None
                    }
                    None => {
                        tracing::info!("Unknown tracking code {}", code);
                        None
                    }
                }
            }
            _ => None,
        };
        let ctx = CreateContext {
            ip: requester_ip.clone(),
            now,
            attribution: collaborator.as_ref().map(|c| c.attribution()),
        };
        let mut lead = self.repos.leads.create(input, ctx).await?;
        tracing::info!("Lead {} created", lead.id);

        // 2. Commission pre-estimate
        if let Some(collaborator) = collaborator.as_ref().filter(|_| phone_verified) {
            let estimate = collaborator.estimate_commission(lead.ticket_estimated_eur);
            let patch = LeadPatch {
                commission_estimated_eur: Some(Some(estimate)),
                ..LeadPatch::default()
            };
            if let Some(updated) =
                best_effort("commission estimate", &lead.id, self.apply(&lead.id, patch)).await
            {
                lead = updated;
            }
        }

        // 3.
        let submit_ctx = EventContext {
            ip: requester_ip,
            ..EventContext::default()
        };
        self.record(
            &lead.id,
            events::LEAD_SUBMITTED,
            json!({
                "lead_id": lead.id,
                "city": lead.city,
                "risk_level": lead.risk_level,
                "business_type": lead.business_type,
                "collaborator_id": lead.collaborator_id,
            }),
            &submit_ctx,
        )
        .await;

        // 4. Validate
        lead = self.apply(&lead.id, LeadPatch::status(LeadStatus::Validated)).await?;

        // 5. Select
        let candidates = self.repos.providers.list_active().await?;
        let selected = select_providers(
            &lead,
            &candidates,
            self.repos.leads.as_ref(),
            self.max_providers_per_lead,
            now,
        )
        .await?;
        let provider_ids: Vec<String> = selected.iter().map(|p| p.id.clone()).collect();

        // 6. Assign
        if !selected.is_empty() {
            lead = self
                .apply(&lead.id, assignment_patch(&provider_ids, now, LeadStatus::Assigned, AssignmentMode::Auto, None))
                .await?;
            self.repos.providers.touch_assigned_at(&provider_ids, now).await?;
            tracing::info!("Lead {} assigned to {:?}", lead.id, provider_ids);
        } else {
            tracing::info!("No eligible provider for lead {}", lead.id);
        }

        // 7.
        self.record(
            &lead.id,
            events::LEAD_ASSIGNED,
            json!({
                "lead_id": lead.id,
                "provider_ids": provider_ids,
                "assigned_provider_id": lead.assigned_provider_id,
                "provider_count": provider_ids.len(),
            }),
            &submit_ctx,
        )
        .await;

        // 8. Notify providers
        self.notify_providers(&selected, &lead).await;

        // 9.
        if !selected.is_empty() {
            lead = self.apply(&lead.id, LeadPatch::status(LeadStatus::Sent)).await?;
        }

        // 10. Confirm to requester
        if !lead.email.is_empty() {
            best_effort(
                "confirmation email",
                &lead.id,
                self.notifier
                    .send_user_confirmation_email(&lead, self.max_providers_per_lead),
            )
            .await;
        }

        // 11.
        self.record(
            &lead.id,
            events::LEAD_SENT,
            json!({
                "lead_id": lead.id,
                "provider_count": provider_ids.len(),
                "email_mode": self.notifier.mode(),
            }),
            &submit_ctx,
        )
        .await;

        Ok(AssignmentOutcome {
            lead,
            assigned_providers: selected,
            warnings: Vec::new(),
        })
    }

    fn ensure_reassignable(lead: &Lead) -> Result<(), PipelineError> {
        if lead.status.allows_provider_reassignment() {
            Ok(())
        } else {
            Err(PipelineError::NotAllowed {
                lead_id: lead.id.clone(),
                status: lead.status,
                action: "provider reassignment",
            })
        }
    }

    /// Re-run automatic selection for an existing lead.
    pub async fn reassign_auto(&self, lead_id: &str, ctx: &EventContext) -> Result<AssignmentOutcome, PipelineError> {
        let now = Utc::now();
        let lead = self.load_lead(lead_id).await?;
        Self::ensure_reassignable(&lead)?;

        let candidates = self.repos.providers.list_active().await?;
        let selected = select_providers(
            &lead,
            &candidates,
            self.repos.leads.as_ref(),
            self.max_providers_per_lead,
            now,
        )
        .await?;
        let provider_ids: Vec<String> = selected.iter().map(|p| p.id.clone()).collect();

        let patch = if selected.is_empty() {
            LeadPatch {
                provider_ids: Some(Vec::new()),
                assigned_provider_id: Some(None),
                assigned_at: Some(None),
                assignment_mode: Some(AssignmentMode::Auto),
                assigned_by: Some(Some("admin".to_string())),
                status: Some(lead.status.after_empty_assignment()),
                ..LeadPatch::default()
            }
        } else {
            assignment_patch(
                &provider_ids,
                now,
                lead.status.after_assignment(),
                AssignmentMode::Auto,
                Some("admin"),
            )
        };
        let updated = self.apply(&lead.id, patch).await?;
        if !provider_ids.is_empty() {
            self.repos.providers.touch_assigned_at(&provider_ids, now).await?;
        }

        self.record(
            &updated.id,
            events::LEAD_REASSIGNED_AUTO,
            json!({
                "lead_id": updated.id,
                "provider_ids": provider_ids,
                "assigned_provider_id": updated.assigned_provider_id,
                "provider_count": provider_ids.len(),
                "previous_provider_ids": lead.provider_ids,
                "previous_assigned_provider_id": lead.assigned_provider_id,
            }),
            ctx,
        )
        .await;

        // Only the primary provider hears about an automatic reassignment
        self.notify_providers(&selected[..selected.len().min(1)], &updated)
            .await;

        Ok(AssignmentOutcome {
            lead: updated,
            assigned_providers: selected,
            warnings: Vec::new(),
        })
    }

    /// Assign explicit providers chosen by an admin.
    pub async fn assign_manual(
        &self,
        lead_id: &str,
        provider_ids: Vec<String>,
        note: Option<String>,
        ctx: &EventContext,
    ) -> Result<AssignmentOutcome, PipelineError> {
        let now = Utc::now();
        let mut ids: Vec<String> = Vec::new();
        for id in provider_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            return Err(PipelineError::InvalidRequest("provider_ids is required".to_string()));
        }
        if ids.len() > self.max_providers_per_lead {
            return Err(PipelineError::InvalidRequest(format!(
                "provider_ids max is {}",
                self.max_providers_per_lead
            )));
        }

        let lead = self.load_lead(lead_id).await?;
        Self::ensure_reassignable(&lead)?;

        let providers = self.repos.providers.get_by_ids(&ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !providers.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::UnknownProviders(missing));
        }

        let inactive: Vec<&str> = providers
            .iter()
            .filter(|p| !p.active)
            .map(|p| p.id.as_str())
            .collect();
        let warnings = if inactive.is_empty() {
            Vec::new()
        } else {
            vec![format!("inactive_providers: {}", inactive.join(", "))]
        };

        let mut patch = assignment_patch(
            &ids,
            now,
            lead.status.after_assignment(),
            AssignmentMode::Manual,
            Some("admin"),
        );
        if let Some(note) = note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            patch.notes = Some(
                format!("{}\n[ADMIN manual assign {}] {}", lead.notes, now.to_rfc3339(), note)
                    .trim()
                    .to_string(),
            );
        }
        let updated = self.apply(&lead.id, patch).await?;
        self.repos.providers.touch_assigned_at(&ids, now).await?;

        self.record(
            &updated.id,
            events::LEAD_ASSIGNED_MANUAL,
            json!({
                "lead_id": updated.id,
                "provider_ids": ids,
                "assigned_provider_id": updated.assigned_provider_id,
                "previous_provider_ids": lead.provider_ids,
                "previous_assigned_provider_id": lead.assigned_provider_id,
                "warnings": warnings,
            }),
            ctx,
        )
        .await;

        self.notify_providers(&providers, &updated).await;

        Ok(AssignmentOutcome {
            lead: updated,
            assigned_providers: providers,
            warnings,
        })
    }

    /// Admin edit of status and notes.
    pub async fn update_lead(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        notes: Option<String>,
    ) -> Result<Lead, PipelineError> {
        let patch = LeadPatch {
            status,
            notes,
            ..LeadPatch::default()
        };
        self.repos
            .leads
            .update(lead_id, patch)
            .await?
            .ok_or_else(|| PipelineError::LeadNotFound(lead_id.to_string()))
    }

    /// Attach, replace or clear the collaborator credited for a lead.
    pub async fn set_collaborator(
        &self,
        lead_id: &str,
        tracking_code: Option<&str>,
        ctx: &EventContext,
    ) -> Result<Lead, PipelineError> {
        let lead = self.load_lead(lead_id).await?;
        if lead.status.locks_collaborator() {
            return Err(PipelineError::NotAllowed {
                lead_id: lead.id.clone(),
                status: lead.status,
                action: "collaborator change",
            });
        }

        let patch = match tracking_code.map(str::trim).filter(|c| !c.is_empty()) {
            None => LeadPatch {
                collaborator_id: Some(None),
                collaborator_tracking_code: Some(None),
                commission_estimated_eur: Some(None),
                ..LeadPatch::default()
            },
            Some(code) => {
                let collaborator = self
                    .repos
                    .collaborators
                    .find_by_tracking_code(code)
                    .await?
                    .ok_or_else(|| PipelineError::CollaboratorNotFound(code.to_string()))?;
                if !collaborator.is_active() {
                    return Err(PipelineError::CollaboratorInactive(collaborator.id));
                }
                LeadPatch {
                    commission_estimated_eur: Some(Some(
                        collaborator.estimate_commission(lead.ticket_estimated_eur),
                    )),
                    collaborator_id: Some(Some(collaborator.id)),
                    collaborator_tracking_code: Some(Some(collaborator.tracking_code)),
                    ..LeadPatch::default()
                }
            }
        };
        let updated = self.apply(&lead.id, patch).await?;

        self.record(
            &updated.id,
            events::LEAD_COLLABORATOR_CHANGED,
            json!({
                "lead_id": updated.id,
                "collaborator_id": updated.collaborator_id,
                "previous_collaborator_id": lead.collaborator_id,
                "commission_estimated_eur": updated.commission_estimated_eur,
            }),
            ctx,
        )
        .await;

        Ok(updated)
    }

    /// Soft delete a lead and scrub its personal data.
    pub async fn anonymize(
        &self,
        lead_id: &str,
        reason: Option<&str>,
        ctx: &EventContext,
    ) -> Result<Lead, PipelineError> {
        let lead = self.load_lead(lead_id).await?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let anonymized = self
            .repos
            .leads
            .anonymize(&lead.id, reason)
            .await?
            .ok_or_else(|| PipelineError::LeadNotFound(lead_id.to_string()))?;

        self.record(
            &lead.id,
            events::LEAD_ANONYMIZED,
            json!({
                "lead_id": lead.id,
                "previous_status": lead.status,
                "previous_provider_ids": lead.provider_ids,
                "reason": reason,
            }),
            ctx,
        )
        .await;

        Ok(anonymized)
    }

    /// Delete a provider no lead references.
    pub async fn delete_provider(&self, provider_id: &str, ctx: &EventContext) -> Result<Provider, PipelineError> {
        let provider = self
            .repos
            .providers
            .get_by_id(provider_id)
            .await?
            .ok_or_else(|| PipelineError::ProviderNotFound(provider_id.to_string()))?;

        let leads = self.repos.leads.list().await?;
        if leads.iter().any(|lead| lead.references_provider(provider_id)) {
            return Err(PipelineError::ProviderInUse(provider_id.to_string()));
        }

        if !self.repos.providers.delete(provider_id).await? {
            return Err(PipelineError::ProviderNotFound(provider_id.to_string()));
        }

        self.record(
            provider_id,
            events::PROVIDER_DELETED,
            json!({
                "provider_id": provider.id,
                "provider_name": provider.name,
            }),
            ctx,
        )
        .await;

        Ok(provider)
    }

    /// Dashboard counters.
    pub async fn metrics(&self) -> Result<Metrics, PipelineError> {
        let leads = self.repos.leads.list().await?;
        let providers = self.repos.providers.list().await?;
        let events_by_name = self.repos.events.count_by_name().await?;

        let mut leads_by_status = BTreeMap::new();
        for lead in &leads {
            *leads_by_status.entry(lead.status.to_string()).or_insert(0) += 1;
        }

        Ok(Metrics {
            totals: MetricsTotals {
                leads: leads.len(),
                providers: providers.len(),
                events: events_by_name.values().sum(),
            },
            leads_by_status,
            events_by_name,
        })
    }
}

fn assignment_patch(
    provider_ids: &[String],
    now: DateTime<Utc>,
    status: LeadStatus,
    mode: AssignmentMode,
    assigned_by: Option<&str>,
) -> LeadPatch {
    LeadPatch {
        provider_ids: Some(provider_ids.to_vec()),
        assigned_provider_id: Some(provider_ids.first().cloned()),
        assigned_at: Some(Some(now)),
        assignment_mode: Some(mode),
        assigned_by: Some(assigned_by.map(str::to_string)),
        status: Some(status),
        ..LeadPatch::default()
    }
}
