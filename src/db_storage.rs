use crate::models::{
    AssignmentMode, Collaborator, CollaboratorInput, CreateContext, IntentPlazo, Lead, LeadEvent,
    LeadInput, LeadPatch, LeadStatus, Provider, ProviderInput, ValidationError,
};
use crate::repository::{
    CollaboratorRepository, EventRepository, LeadRepository, ProviderRepository, RepoResult,
    RepositoryError,
};
use crate::scoring::RiskLevel;
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;

const LEAD_COLUMNS: &str = "id, created_at, name, email, phone, city, postal_code, business_type, \
    risk_level, risk_score, urgency, budget_range, intent_plazo, lead_score, ticket_estimated_eur, \
    price_eur, notes, evaluation_summary, status, provider_ids, assigned_provider_id, assigned_at, \
    assignment_mode, assigned_by, accepted_at, sold_at, updated_at, deleted_at, consent, \
    consent_timestamp, consent_ip, collaborator_id, collaborator_tracking_code, commission_estimated_eur";

const PROVIDER_COLUMNS: &str =
    "id, name, email, phone, zones, business_types, active, priority, daily_cap, last_assigned_at";

const COLLABORATOR_COLUMNS: &str =
    "id, name, type, tracking_code, commission_type, commission_value, status, created_at, updated_at";

#[derive(Debug, FromRow)]
struct LeadRow {
    id: String,
    created_at: DateTime<Utc>,
    name: String,
    email: String,
    phone: String,
    city: String,
    postal_code: String,
    business_type: String,
    risk_level: String,
    risk_score: Option<f64>,
    urgency: String,
    budget_range: String,
    intent_plazo: Option<String>,
    lead_score: i64,
    ticket_estimated_eur: i64,
    price_eur: i64,
    notes: String,
    evaluation_summary: Option<Json<Value>>,
    status: String,
    provider_ids: Json<Vec<String>>,
    assigned_provider_id: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    assignment_mode: String,
    assigned_by: Option<String>,
    accepted_at: Option<DateTime<Utc>>,
    sold_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    consent: bool,
    consent_timestamp: Option<DateTime<Utc>>,
    consent_ip: Option<String>,
    collaborator_id: Option<String>,
    collaborator_tracking_code: Option<String>,
    commission_estimated_eur: Option<i64>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = RepositoryError;

    fn try_from(row: LeadRow) -> Result<Self, Self::Error> {
        let risk_level =
            RiskLevel::parse_lenient(&row.risk_level).ok_or_else(|| ValidationError::InvalidValue {
                field: "risk_level",
                value: row.risk_level.clone(),
            })?;

        Ok(Lead {
            id: row.id,
            created_at: row.created_at,
            name: row.name,
            email: row.email,
            phone: row.phone,
            city: row.city,
            postal_code: row.postal_code,
            business_type: row.business_type,
            risk_level,
            risk_score: row.risk_score,
            urgency: row.urgency,
            budget_range: row.budget_range,
            intent_plazo: row.intent_plazo.as_deref().and_then(IntentPlazo::parse_lenient),
            lead_score: row.lead_score,
            ticket_estimated_eur: row.ticket_estimated_eur,
            price_eur: row.price_eur,
            notes: row.notes,
            evaluation_summary: row.evaluation_summary.map(|Json(v)| v),
            status: LeadStatus::from_str(&row.status)?,
            provider_ids: row.provider_ids.0,
            assigned_provider_id: row.assigned_provider_id,
            assigned_at: row.assigned_at,
            assignment_mode: AssignmentMode::from_str(&row.assignment_mode)?,
            assigned_by: row.assigned_by,
            accepted_at: row.accepted_at,
            sold_at: row.sold_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            consent: row.consent,
            consent_timestamp: row.consent_timestamp,
            consent_ip: row.consent_ip,
            collaborator_id: row.collaborator_id,
            collaborator_tracking_code: row.collaborator_tracking_code,
            commission_estimated_eur: row.commission_estimated_eur,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProviderRow {
    id: String,
    name: String,
    email: String,
    phone: String,
    zones: Json<Vec<String>>,
    business_types: Json<Vec<String>>,
    active: bool,
    priority: i32,
    daily_cap: i32,
    last_assigned_at: Option<DateTime<Utc>>,
}

impl From<ProviderRow> for Provider {
    fn from(row: ProviderRow) -> Self {
        Provider {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            zones: row.zones.0,
            business_types: row.business_types.0,
            active: row.active,
            priority: row.priority,
            daily_cap: row.daily_cap,
            last_assigned_at: row.last_assigned_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CollaboratorRow {
    id: String,
    name: String,
    #[sqlx(rename = "type")]
    collaborator_type: String,
    tracking_code: String,
    commission_type: String,
    commission_value: BigDecimal,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CollaboratorRow> for Collaborator {
    type Error = RepositoryError;

    fn try_from(row: CollaboratorRow) -> Result<Self, Self::Error> {
        Ok(Collaborator {
            id: row.id,
            name: row.name,
            collaborator_type: row.collaborator_type,
            tracking_code: row.tracking_code,
            commission_type: row.commission_type.parse()?,
            commission_value: row.commission_value.to_f64().unwrap_or(0.0),
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    event_name: String,
    timestamp: DateTime<Utc>,
    payload: Json<Value>,
    context: Json<Value>,
}

impl From<EventRow> for LeadEvent {
    fn from(row: EventRow) -> Self {
        LeadEvent {
            id: row.id,
            event_name: row.event_name,
            timestamp: row.timestamp,
            payload: row.payload.0,
            context: row.context.0,
        }
    }
}

fn to_numeric(value: f64) -> BigDecimal {
    BigDecimal::from_str(&format!("{:.2}", value)).unwrap_or_default()
}

/// PostgreSQL implementation of every repository.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_lead(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> RepoResult<Option<Lead>> {
        let row = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {} FROM leads WHERE id = $1 FOR UPDATE",
            LEAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Lead::try_from).transpose()
    }

    /// Write every column of an existing lead.
    async fn save_lead(tx: &mut Transaction<'_, Postgres>, lead: &Lead) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE leads SET
                name = $2, email = $3, phone = $4, city = $5, postal_code = $6,
                business_type = $7, risk_level = $8, risk_score = $9, urgency = $10,
                budget_range = $11, intent_plazo = $12, lead_score = $13,
                ticket_estimated_eur = $14, price_eur = $15, notes = $16,
                evaluation_summary = $17, status = $18, provider_ids = $19,
                assigned_provider_id = $20, assigned_at = $21, assignment_mode = $22,
                assigned_by = $23, accepted_at = $24, sold_at = $25, updated_at = $26,
                deleted_at = $27, consent = $28, consent_timestamp = $29, consent_ip = $30,
                collaborator_id = $31, collaborator_tracking_code = $32,
                commission_estimated_eur = $33
            WHERE id = $1
            "#,
        )
        .bind(&lead.id)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.city)
        .bind(&lead.postal_code)
        .bind(&lead.business_type)
        .bind(lead.risk_level.as_str())
        .bind(lead.risk_score)
        .bind(&lead.urgency)
        .bind(&lead.budget_range)
        .bind(lead.intent_plazo.map(IntentPlazo::as_str))
        .bind(lead.lead_score)
        .bind(lead.ticket_estimated_eur)
        .bind(lead.price_eur)
        .bind(&lead.notes)
        .bind(lead.evaluation_summary.as_ref().map(Json))
        .bind(lead.status.as_str())
        .bind(Json(&lead.provider_ids))
        .bind(&lead.assigned_provider_id)
        .bind(lead.assigned_at)
        .bind(lead.assignment_mode.as_str())
        .bind(&lead.assigned_by)
        .bind(lead.accepted_at)
        .bind(lead.sold_at)
        .bind(lead.updated_at)
        .bind(lead.deleted_at)
        .bind(lead.consent)
        .bind(lead.consent_timestamp)
        .bind(&lead.consent_ip)
        .bind(&lead.collaborator_id)
        .bind(&lead.collaborator_tracking_code)
        .bind(lead.commission_estimated_eur)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_lead(&self, lead: &Lead) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO leads ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, \
             $29, $30, $31, $32, $33, $34)",
            LEAD_COLUMNS
        ))
        .bind(&lead.id)
        .bind(lead.created_at)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.city)
        .bind(&lead.postal_code)
        .bind(&lead.business_type)
        .bind(lead.risk_level.as_str())
        .bind(lead.risk_score)
        .bind(&lead.urgency)
        .bind(&lead.budget_range)
        .bind(lead.intent_plazo.map(IntentPlazo::as_str))
        .bind(lead.lead_score)
        .bind(lead.ticket_estimated_eur)
        .bind(lead.price_eur)
        .bind(&lead.notes)
        .bind(lead.evaluation_summary.as_ref().map(Json))
        .bind(lead.status.as_str())
        .bind(Json(&lead.provider_ids))
        .bind(&lead.assigned_provider_id)
        .bind(lead.assigned_at)
        .bind(lead.assignment_mode.as_str())
        .bind(&lead.assigned_by)
        .bind(lead.accepted_at)
        .bind(lead.sold_at)
        .bind(lead.updated_at)
        .bind(lead.deleted_at)
        .bind(lead.consent)
        .bind(lead.consent_timestamp)
        .bind(&lead.consent_ip)
        .bind(&lead.collaborator_id)
        .bind(&lead.collaborator_tracking_code)
        .bind(lead.commission_estimated_eur)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_provider(&self, provider: &Provider, insert: bool) -> RepoResult<()> {
        let sql = if insert {
            format!(
                "INSERT INTO providers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                PROVIDER_COLUMNS
            )
        } else {
            "UPDATE providers SET name = $2, email = $3, phone = $4, zones = $5, \
             business_types = $6, active = $7, priority = $8, daily_cap = $9, \
             last_assigned_at = $10 WHERE id = $1"
                .to_string()
        };
        sqlx::query(&sql)
            .bind(&provider.id)
            .bind(&provider.name)
            .bind(&provider.email)
            .bind(&provider.phone)
            .bind(Json(&provider.zones))
            .bind(Json(&provider.business_types))
            .bind(provider.active)
            .bind(provider.priority)
            .bind(provider.daily_cap)
            .bind(provider.last_assigned_at)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation(e, || format!("provider {} already exists", provider.id)))?;
        Ok(())
    }

    async fn save_collaborator(&self, collaborator: &Collaborator, insert: bool) -> RepoResult<()> {
        let sql = if insert {
            format!(
                "INSERT INTO collaborators ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                COLLABORATOR_COLUMNS
            )
        } else {
            "UPDATE collaborators SET name = $2, type = $3, tracking_code = $4, \
             commission_type = $5, commission_value = $6, status = $7, created_at = $8, \
             updated_at = $9 WHERE id = $1"
                .to_string()
        };
        sqlx::query(&sql)
            .bind(&collaborator.id)
            .bind(&collaborator.name)
            .bind(&collaborator.collaborator_type)
            .bind(&collaborator.tracking_code)
            .bind(collaborator.commission_type.as_str())
            .bind(to_numeric(collaborator.commission_value))
            .bind(collaborator.status.as_str())
            .bind(collaborator.created_at)
            .bind(collaborator.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                unique_violation(e, || {
                    format!("tracking code {} already in use", collaborator.tracking_code)
                })
            })?;
        Ok(())
    }
}

fn unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(message())
        }
        _ => RepositoryError::Database(err),
    }
}

#[async_trait]
impl LeadRepository for PgStore {
    async fn create(&self, input: LeadInput, ctx: CreateContext) -> RepoResult<Lead> {
        let lead = Lead::from_input(input, ctx)?;
        self.insert_lead(&lead).await?;
        tracing::debug!("Stored lead {}", lead.id);
        Ok(lead)
    }

    async fn update(&self, id: &str, patch: LeadPatch) -> RepoResult<Option<Lead>> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = Self::lock_lead(&mut tx, id).await? else {
            return Ok(None);
        };
        let updated = current.apply_patch(patch, Utc::now())?;
        Self::save_lead(&mut tx, &updated).await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Lead>> {
        let row = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {} FROM leads WHERE id = $1",
            LEAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Lead::try_from).transpose()
    }

    async fn list(&self) -> RepoResult<Vec<Lead>> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {} FROM leads ORDER BY created_at DESC",
            LEAD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Lead::try_from).collect()
    }

    async fn anonymize(&self, id: &str, reason: Option<&str>) -> RepoResult<Option<Lead>> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = Self::lock_lead(&mut tx, id).await? else {
            return Ok(None);
        };
        let scrubbed = current.anonymized(reason, Utc::now());
        Self::save_lead(&mut tx, &scrubbed).await?;
        tx.commit().await?;
        Ok(Some(scrubbed))
    }

    async fn count_assigned_for_provider_on_date(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> RepoResult<u32> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        let end = start + chrono::Duration::days(1);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leads \
             WHERE created_at >= $1 AND created_at < $2 AND provider_ids @> $3",
        )
        .bind(start)
        .bind(end)
        .bind(Json(vec![provider_id]))
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl ProviderRepository for PgStore {
    async fn list(&self) -> RepoResult<Vec<Provider>> {
        let rows = sqlx::query_as::<_, ProviderRow>(&format!(
            "SELECT {} FROM providers ORDER BY name",
            PROVIDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Provider::from).collect())
    }

    async fn list_active(&self) -> RepoResult<Vec<Provider>> {
        let rows = sqlx::query_as::<_, ProviderRow>(&format!(
            "SELECT {} FROM providers WHERE active ORDER BY name",
            PROVIDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Provider::from).collect())
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Provider>> {
        let row = sqlx::query_as::<_, ProviderRow>(&format!(
            "SELECT {} FROM providers WHERE id = $1",
            PROVIDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Provider::from))
    }

    async fn create(&self, input: ProviderInput) -> RepoResult<Provider> {
        let provider = Provider::from_input(input, None)?;
        self.save_provider(&provider, true).await?;
        Ok(provider)
    }

    async fn update(&self, id: &str, input: ProviderInput) -> RepoResult<Option<Provider>> {
        let Some(existing) = ProviderRepository::get_by_id(self, id).await? else {
            return Ok(None);
        };
        let updated = Provider::from_input(input, Some(&existing))?;
        self.save_provider(&updated, false).await?;
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM providers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_assigned_at(&self, ids: &[String], at: DateTime<Utc>) -> RepoResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE providers SET last_assigned_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CollaboratorRepository for PgStore {
    async fn list(&self) -> RepoResult<Vec<Collaborator>> {
        let rows = sqlx::query_as::<_, CollaboratorRow>(&format!(
            "SELECT {} FROM collaborators ORDER BY created_at DESC",
            COLLABORATOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Collaborator::try_from).collect()
    }

    async fn get_by_id(&self, id: &str) -> RepoResult<Option<Collaborator>> {
        let row = sqlx::query_as::<_, CollaboratorRow>(&format!(
            "SELECT {} FROM collaborators WHERE id = $1",
            COLLABORATOR_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Collaborator::try_from).transpose()
    }

    async fn find_by_tracking_code(&self, code: &str) -> RepoResult<Option<Collaborator>> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, CollaboratorRow>(&format!(
            "SELECT {} FROM collaborators WHERE tracking_code = $1",
            COLLABORATOR_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Collaborator::try_from).transpose()
    }

    async fn create(&self, input: CollaboratorInput) -> RepoResult<Collaborator> {
        let collaborator = Collaborator::from_input(input, None, Utc::now())?;
        self.save_collaborator(&collaborator, true).await?;
        Ok(collaborator)
    }

    async fn update(&self, id: &str, input: CollaboratorInput) -> RepoResult<Option<Collaborator>> {
        let Some(existing) = CollaboratorRepository::get_by_id(self, id).await? else {
            return Ok(None);
        };
        let updated = Collaborator::from_input(input, Some(&existing), Utc::now())?;
        self.save_collaborator(&updated, false).await?;
        Ok(Some(updated))
    }
}

#[async_trait]
impl EventRepository for PgStore {
    async fn append(&self, event: LeadEvent) -> RepoResult<LeadEvent> {
        sqlx::query(
            "INSERT INTO events (id, event_name, timestamp, payload, context) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.id)
        .bind(&event.event_name)
        .bind(event.timestamp)
        .bind(Json(&event.payload))
        .bind(Json(&event.context))
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    async fn list(&self, limit: usize) -> RepoResult<Vec<LeadEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, event_name, timestamp, payload, context FROM events \
             ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LeadEvent::from).collect())
    }

    async fn count_by_name(&self) -> RepoResult<BTreeMap<String, usize>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT event_name, COUNT(*) FROM events GROUP BY event_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, count)| (name, usize::try_from(count).unwrap_or(0)))
            .collect())
    }
}
