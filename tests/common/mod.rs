//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use punto_seguro_api::json_store::JsonStore;
use chrono::NaiveDate;
use punto_seguro_api::models::{
    CreateContext, Lead, LeadEvent, LeadInput, LeadPatch, Provider, ProviderInput, StringList,
};
use punto_seguro_api::notifications::{LeadNotifier, NotificationError};
use punto_seguro_api::repository::{
    EventRepository, LeadRepository, RepoResult, Repositories, RepositoryError,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// JSON-backed repositories in a throwaway directory. Keep the `TempDir` alive.
pub fn temp_repositories() -> (TempDir, Repositories) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Arc::new(JsonStore::new(dir.path()));
    (dir, Repositories::from_store(store))
}

pub fn lead_input(city: &str, postal_code: &str, business_type: &str) -> LeadInput {
    LeadInput {
        name: Some("Laura Gómez".to_string()),
        email: Some("laura@example.com".to_string()),
        phone: Some("+34 612 345 678".to_string()),
        city: Some(city.to_string()),
        postal_code: Some(postal_code.to_string()),
        business_type: Some(business_type.to_string()),
        risk_level: Some("alto".to_string()),
        urgency: Some("alta".to_string()),
        budget_range: Some("1500_3000".to_string()),
        consent: true,
        ..LeadInput::default()
    }
}

pub fn provider_input(name: &str, zones: &[&str], business_types: &[&str], priority: i32) -> ProviderInput {
    ProviderInput {
        name: Some(name.to_string()),
        email: Some(format!(
            "{}@proveedores.example",
            name.to_lowercase().replace(' ', "-")
        )),
        zones: Some(StringList::from(zones.to_vec())),
        business_types: Some(StringList::from(business_types.to_vec())),
        active: Some(true),
        priority: Some(priority),
        daily_cap: Some(10),
        ..ProviderInput::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Provider { provider_id: String, lead_id: String },
    Confirmation { lead_id: String, provider_count: usize },
}

/// Notifier that records every call and fails for selected provider ids.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    failing_providers: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn fail_for(&self, provider_id: &str) {
        self.failing_providers
            .lock()
            .unwrap()
            .insert(provider_id.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn provider_emails(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Provider { provider_id, .. } => Some(provider_id),
                Sent::Confirmation { .. } => None,
            })
            .collect()
    }

    pub fn confirmations(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::Confirmation { .. }))
            .count()
    }
}

#[async_trait]
impl LeadNotifier for RecordingNotifier {
    async fn send_provider_lead_email(
        &self,
        provider: &Provider,
        lead: &Lead,
    ) -> Result<(), NotificationError> {
        if self.failing_providers.lock().unwrap().contains(&provider.id) {
            return Err(NotificationError::RelayStatus {
                status: 503,
                body: "relay down".to_string(),
            });
        }
        self.sent.lock().unwrap().push(Sent::Provider {
            provider_id: provider.id.clone(),
            lead_id: lead.id.clone(),
        });
        Ok(())
    }

    async fn send_user_confirmation_email(
        &self,
        lead: &Lead,
        provider_count: usize,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(Sent::Confirmation {
            lead_id: lead.id.clone(),
            provider_count,
        });
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "recording"
    }
}

fn storage_down(what: &str) -> RepositoryError {
    RepositoryError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{what} unavailable"),
    ))
}

/// Event log whose appends always fail.
pub struct BrokenEvents;

#[async_trait]
impl EventRepository for BrokenEvents {
    async fn append(&self, _event: LeadEvent) -> RepoResult<LeadEvent> {
        Err(storage_down("event log"))
    }

    async fn list(&self, _limit: usize) -> RepoResult<Vec<LeadEvent>> {
        Ok(Vec::new())
    }

    async fn count_by_name(&self) -> RepoResult<BTreeMap<String, usize>> {
        Ok(BTreeMap::new())
    }
}

/// Lead repository that delegates everything except `update`, which fails.
pub struct FailingLeadUpdates {
    pub inner: Arc<dyn LeadRepository>,
}

#[async_trait]
impl LeadRepository for FailingLeadUpdates {
    async fn create(&self, input: LeadInput, ctx: CreateContext) -> RepoResult<Lead> {
        self.inner.create(input, ctx).await
    }

    async fn update(&self, _id: &str, _patch: LeadPatch) -> RepoResult<Option<Lead>> {
        Err(storage_down("lead store"))
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Lead>> {
        self.inner.get_by_id(id).await
    }

    async fn list(&self) -> RepoResult<Vec<Lead>> {
        self.inner.list().await
    }

    async fn anonymize(&self, id: &str, reason: Option<&str>) -> RepoResult<Option<Lead>> {
        self.inner.anonymize(id, reason).await
    }

    async fn count_assigned_for_provider_on_date(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> RepoResult<u32> {
        self.inner
            .count_assigned_for_provider_on_date(provider_id, date)
            .await
    }
}
