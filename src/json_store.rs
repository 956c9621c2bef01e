//! JSON-file storage backend.
//!
//! One pretty-printed array per collection under the data directory
//! (`leads.json`, `providers.json`, `collaborators.json`, `events.json`).
//! Writes go to `<file>.tmp` and are renamed over the original. Each
//! collection is guarded by its own async mutex, so a single repository call
//! is atomic within the process; nothing coordinates across processes.

use crate::models::{
    Collaborator, CollaboratorInput, CreateContext, Lead, LeadEvent, LeadInput, LeadPatch,
    Provider, ProviderInput,
};
use crate::repository::{
    CollaboratorRepository, EventRepository, LeadRepository, ProviderRepository, RepoResult,
    RepositoryError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

/// A single JSON array on disk.
pub struct JsonCollection<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hold the collection for a read-modify-write sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Missing or blank files read as an empty collection.
    pub async fn read(&self) -> RepoResult<Vec<T>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, items: &[T]) -> RepoResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(items)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// All four repositories over a data directory.
pub struct JsonStore {
    leads: JsonCollection<Lead>,
    providers: JsonCollection<Provider>,
    collaborators: JsonCollection<Collaborator>,
    events: JsonCollection<LeadEvent>,
}

impl JsonStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        tracing::info!("Using JSON file storage at {}", dir.display());
        Self {
            leads: JsonCollection::new(dir.join("leads.json")),
            providers: JsonCollection::new(dir.join("providers.json")),
            collaborators: JsonCollection::new(dir.join("collaborators.json")),
            events: JsonCollection::new(dir.join("events.json")),
        }
    }
}

fn newest_first(leads: &mut [Lead]) {
    leads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl LeadRepository for JsonStore {
    async fn create(&self, input: LeadInput, ctx: CreateContext) -> RepoResult<Lead> {
        let lead = Lead::from_input(input, ctx)?;
        let _guard = self.leads.lock().await;
        let mut leads = self.leads.read().await?;
        leads.insert(0, lead.clone());
        self.leads.write(&leads).await?;
        tracing::debug!("Stored lead {}", lead.id);
        Ok(lead)
    }

    async fn update(&self, id: &str, patch: LeadPatch) -> RepoResult<Option<Lead>> {
        let _guard = self.leads.lock().await;
        let mut leads = self.leads.read().await?;
        let Some(index) = leads.iter().position(|lead| lead.id == id) else {
            return Ok(None);
        };
        let updated = leads[index].apply_patch(patch, Utc::now())?;
        leads[index] = updated.clone();
        self.leads.write(&leads).await?;
        Ok(Some(updated))
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Lead>> {
        let leads = self.leads.read().await?;
        Ok(leads.into_iter().find(|lead| lead.id == id))
    }

    async fn list(&self) -> RepoResult<Vec<Lead>> {
        let mut leads = self.leads.read().await?;
        newest_first(&mut leads);
        Ok(leads)
    }

    async fn anonymize(&self, id: &str, reason: Option<&str>) -> RepoResult<Option<Lead>> {
        let _guard = self.leads.lock().await;
        let mut leads = self.leads.read().await?;
        let Some(index) = leads.iter().position(|lead| lead.id == id) else {
            return Ok(None);
        };
        let scrubbed = leads[index].anonymized(reason, Utc::now());
        leads[index] = scrubbed.clone();
        self.leads.write(&leads).await?;
        Ok(Some(scrubbed))
    }

    async fn count_assigned_for_provider_on_date(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> RepoResult<u32> {
        let leads = self.leads.read().await?;
        let count = leads
            .iter()
            .filter(|lead| lead.created_at.date_naive() == date)
            .filter(|lead| lead.provider_ids.iter().any(|id| id == provider_id))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl ProviderRepository for JsonStore {
    async fn list(&self) -> RepoResult<Vec<Provider>> {
        self.providers.read().await
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Provider>> {
        let providers = self.providers.read().await?;
        Ok(providers.into_iter().find(|p| p.id == id))
    }

    async fn create(&self, input: ProviderInput) -> RepoResult<Provider> {
        let provider = Provider::from_input(input, None)?;
        let _guard = self.providers.lock().await;
        let mut providers = self.providers.read().await?;
        if providers.iter().any(|p| p.id == provider.id) {
            return Err(RepositoryError::Conflict(format!(
                "provider {} already exists",
                provider.id
            )));
        }
        providers.push(provider.clone());
        self.providers.write(&providers).await?;
        Ok(provider)
    }

    async fn update(&self, id: &str, input: ProviderInput) -> RepoResult<Option<Provider>> {
        let _guard = self.providers.lock().await;
        let mut providers = self.providers.read().await?;
        let Some(index) = providers.iter().position(|p| p.id == id) else {
            return Ok(None);
        };
        let updated = Provider::from_input(input, Some(&providers[index]))?;
        providers[index] = updated.clone();
        self.providers.write(&providers).await?;
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> RepoResult<bool> {
        let _guard = self.providers.lock().await;
        let mut providers = self.providers.read().await?;
        let before = providers.len();
        providers.retain(|p| p.id != id);
        if providers.len() == before {
            return Ok(false);
        }
        self.providers.write(&providers).await?;
        Ok(true)
    }

    async fn touch_assigned_at(&self, ids: &[String], at: DateTime<Utc>) -> RepoResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.providers.lock().await;
        let mut providers = self.providers.read().await?;
        for provider in providers.iter_mut().filter(|p| ids.contains(&p.id)) {
            provider.last_assigned_at = Some(at);
        }
        self.providers.write(&providers).await
    }
}

#[async_trait]
impl CollaboratorRepository for JsonStore {
    async fn list(&self) -> RepoResult<Vec<Collaborator>> {
        self.collaborators.read().await
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Collaborator>> {
        let collaborators = self.collaborators.read().await?;
        Ok(collaborators.into_iter().find(|c| c.id == id))
    }

    async fn find_by_tracking_code(&self, code: &str) -> RepoResult<Option<Collaborator>> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return Ok(None);
        }
        let collaborators = self.collaborators.read().await?;
        Ok(collaborators.into_iter().find(|c| c.tracking_code == code))
    }

    async fn create(&self, input: CollaboratorInput) -> RepoResult<Collaborator> {
        let collaborator = Collaborator::from_input(input, None, Utc::now())?;
        let _guard = self.collaborators.lock().await;
        let mut collaborators = self.collaborators.read().await?;
        if collaborators
            .iter()
            .any(|c| c.tracking_code == collaborator.tracking_code)
        {
            return Err(RepositoryError::Conflict(format!(
                "tracking code {} already in use",
                collaborator.tracking_code
            )));
        }
        collaborators.push(collaborator.clone());
        self.collaborators.write(&collaborators).await?;
        Ok(collaborator)
    }

    async fn update(&self, id: &str, input: CollaboratorInput) -> RepoResult<Option<Collaborator>> {
        let _guard = self.collaborators.lock().await;
        let mut collaborators = self.collaborators.read().await?;
        let Some(index) = collaborators.iter().position(|c| c.id == id) else {
            return Ok(None);
        };
        let updated = Collaborator::from_input(input, Some(&collaborators[index]), Utc::now())?;
        if collaborators
            .iter()
            .any(|c| c.id != updated.id && c.tracking_code == updated.tracking_code)
        {
            return Err(RepositoryError::Conflict(format!(
                "tracking code {} already in use",
                updated.tracking_code
            )));
        }
        collaborators[index] = updated.clone();
        self.collaborators.write(&collaborators).await?;
        Ok(Some(updated))
    }
}

#[async_trait]
impl EventRepository for JsonStore {
    async fn append(&self, event: LeadEvent) -> RepoResult<LeadEvent> {
        let _guard = self.events.lock().await;
        let mut events = self.events.read().await?;
        events.push(event.clone());
        self.events.write(&events).await?;
        Ok(event)
    }

    async fn list(&self, limit: usize) -> RepoResult<Vec<LeadEvent>> {
        let mut events = self.events.read().await?;
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn count_by_name(&self) -> RepoResult<BTreeMap<String, usize>> {
        let events = self.events.read().await?;
        let mut counts = BTreeMap::new();
        for event in events {
            *counts.entry(event.event_name).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
