use crate::notifications::DEFAULT_FROM;
use crate::orchestrator::DEFAULT_MAX_PROVIDERS_PER_LEAD;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. When absent the JSON file store under `data_dir` is used.
    pub database_url: Option<String>,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_providers_per_lead: usize,
    pub admin_token: Option<String>,
    pub email_from: String,
    pub email_relay_url: Option<String>,
    pub email_relay_token: Option<String>,
    pub require_phone_verification: bool,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be true or false", name),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: non_empty_var("DATABASE_URL")
                .or_else(|| non_empty_var("DB_URL"))
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: non_empty_var("PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            data_dir: non_empty_var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            max_providers_per_lead: match non_empty_var("MAX_PROVIDERS_PER_LEAD") {
                Some(raw) => {
                    let value: usize = raw.parse().map_err(|_| {
                        anyhow::anyhow!("MAX_PROVIDERS_PER_LEAD must be a positive integer")
                    })?;
                    if value == 0 {
                        anyhow::bail!("MAX_PROVIDERS_PER_LEAD must be at least 1");
                    }
                    value
                }
                None => DEFAULT_MAX_PROVIDERS_PER_LEAD,
            },
            admin_token: non_empty_var("ADMIN_TOKEN"),
            email_from: non_empty_var("EMAIL_FROM").unwrap_or_else(|| DEFAULT_FROM.to_string()),
            email_relay_url: non_empty_var("EMAIL_RELAY_URL")
                .map(|raw| {
                    let parsed = url::Url::parse(&raw)
                        .map_err(|e| anyhow::anyhow!("EMAIL_RELAY_URL is not a valid URL: {}", e))?;
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        anyhow::bail!("EMAIL_RELAY_URL must start with http:// or https://");
                    }
                    Ok(raw)
                })
                .transpose()?,
            email_relay_token: non_empty_var("EMAIL_RELAY_TOKEN"),
            require_phone_verification: non_empty_var("REQUIRE_PHONE_VERIFICATION")
                .map(|raw| parse_bool("REQUIRE_PHONE_VERIFICATION", &raw))
                .transpose()?
                .unwrap_or(false),
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        match &config.database_url {
            Some(url) => tracing::debug!("Database URL: {}...", &url[..20.min(url.len())]),
            None => tracing::debug!("Data directory: {}", config.data_dir.display()),
        }
        if let Some(ref relay) = config.email_relay_url {
            tracing::info!("Email relay configured: {}", relay);
        }
        if config.admin_token.is_none() {
            tracing::warn!("ADMIN_TOKEN not set, admin API is disabled");
        }
        tracing::debug!("Max providers per lead: {}", config.max_providers_per_lead);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
