use sqlx::{postgres::PgPoolOptions, PgPool};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS providers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT NOT NULL DEFAULT '',
        zones JSONB NOT NULL DEFAULT '[]'::jsonb,
        business_types JSONB NOT NULL DEFAULT '[]'::jsonb,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        priority INTEGER NOT NULL DEFAULT 100,
        daily_cap INTEGER NOT NULL DEFAULT 10,
        last_assigned_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS collaborators (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        tracking_code TEXT NOT NULL UNIQUE,
        commission_type TEXT NOT NULL,
        commission_value NUMERIC(12, 2) NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        name TEXT NOT NULL,
        email TEXT NOT NULL DEFAULT '',
        phone TEXT NOT NULL DEFAULT '',
        city TEXT NOT NULL DEFAULT '',
        postal_code TEXT NOT NULL DEFAULT '',
        business_type TEXT NOT NULL DEFAULT 'general',
        risk_level TEXT NOT NULL,
        risk_score DOUBLE PRECISION,
        urgency TEXT NOT NULL,
        budget_range TEXT NOT NULL,
        intent_plazo TEXT,
        lead_score BIGINT NOT NULL DEFAULT 0,
        ticket_estimated_eur BIGINT NOT NULL DEFAULT 0,
        price_eur BIGINT NOT NULL DEFAULT 0,
        notes TEXT NOT NULL DEFAULT '',
        evaluation_summary JSONB,
        status TEXT NOT NULL,
        provider_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
        assigned_provider_id TEXT,
        assigned_at TIMESTAMPTZ,
        assignment_mode TEXT NOT NULL DEFAULT 'auto',
        assigned_by TEXT,
        accepted_at TIMESTAMPTZ,
        sold_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ,
        consent BOOLEAN NOT NULL DEFAULT FALSE,
        consent_timestamp TIMESTAMPTZ,
        consent_ip TEXT,
        collaborator_id TEXT,
        collaborator_tracking_code TEXT,
        commission_estimated_eur BIGINT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_leads_created_at ON leads (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_collaborators_tracking_code ON collaborators (tracking_code)",
    r#"CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        event_name TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        context JSONB NOT NULL DEFAULT '{}'::jsonb
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp DESC)",
];

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Create missing tables. Existing tables are left untouched.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Database schema verified ({} statements)", SCHEMA.len());
        Ok(())
    }
}
