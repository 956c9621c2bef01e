//! Storage contracts shared by the JSON-file and PostgreSQL backends.
//!
//! The pipeline only sees these traits; `main` picks the backend at startup.

use crate::models::{
    Collaborator, CollaboratorInput, CreateContext, Lead, LeadEvent, LeadInput, LeadPatch,
    Provider, ProviderInput, ValidationError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt stored data: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait LeadRepository: Send + Sync {
    /// Validate and persist a new lead.
    async fn create(&self, input: LeadInput, ctx: CreateContext) -> RepoResult<Lead>;

    /// Merge `patch` into the stored lead and re-validate. `None` when the id is unknown.
    async fn update(&self, id: &str, patch: LeadPatch) -> RepoResult<Option<Lead>>;

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Lead>>;

    /// All leads, newest first.
    async fn list(&self) -> RepoResult<Vec<Lead>>;

    /// Soft delete with PII scrubbing. `None` when the id is unknown.
    async fn anonymize(&self, id: &str, reason: Option<&str>) -> RepoResult<Option<Lead>>;

    /// Leads created on `date` (UTC) whose `provider_ids` contain `provider_id`.
    async fn count_assigned_for_provider_on_date(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> RepoResult<u32>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    async fn list(&self) -> RepoResult<Vec<Provider>>;

    async fn list_active(&self) -> RepoResult<Vec<Provider>> {
        Ok(self.list().await?.into_iter().filter(|p| p.active).collect())
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Provider>>;

    /// Providers matching `ids`, in the order of `ids`. Unknown ids are skipped.
    async fn get_by_ids(&self, ids: &[String]) -> RepoResult<Vec<Provider>> {
        let all = self.list().await?;
        Ok(ids
            .iter()
            .filter_map(|id| all.iter().find(|p| &p.id == id).cloned())
            .collect())
    }

    async fn create(&self, input: ProviderInput) -> RepoResult<Provider>;

    async fn update(&self, id: &str, input: ProviderInput) -> RepoResult<Option<Provider>>;

    /// `false` when nothing was deleted.
    async fn delete(&self, id: &str) -> RepoResult<bool>;

    /// Record `at` as the last assignment time of every provider in `ids`.
    async fn touch_assigned_at(&self, ids: &[String], at: DateTime<Utc>) -> RepoResult<()>;
}

#[async_trait]
pub trait CollaboratorRepository: Send + Sync {
    async fn list(&self) -> RepoResult<Vec<Collaborator>>;

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Collaborator>>;

    /// Lookup is case-insensitive; stored codes are uppercase.
    async fn find_by_tracking_code(&self, code: &str) -> RepoResult<Option<Collaborator>>;

    async fn create(&self, input: CollaboratorInput) -> RepoResult<Collaborator>;

    async fn update(&self, id: &str, input: CollaboratorInput) -> RepoResult<Option<Collaborator>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append(&self, event: LeadEvent) -> RepoResult<LeadEvent>;

    /// Most recent events first.
    async fn list(&self, limit: usize) -> RepoResult<Vec<LeadEvent>>;

    /// Number of stored events per event name, over the whole log.
    async fn count_by_name(&self) -> RepoResult<BTreeMap<String, usize>>;
}

/// Handles to every repository, cloned into each request.
#[derive(Clone)]
pub struct Repositories {
    pub leads: Arc<dyn LeadRepository>,
    pub providers: Arc<dyn ProviderRepository>,
    pub collaborators: Arc<dyn CollaboratorRepository>,
    pub events: Arc<dyn EventRepository>,
}

impl Repositories {
    /// All four handles backed by one store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: LeadRepository
            + ProviderRepository
            + CollaboratorRepository
            + EventRepository
            + 'static,
    {
        Self {
            leads: store.clone(),
            providers: store.clone(),
            collaborators: store.clone(),
            events: store,
        }
    }
}
