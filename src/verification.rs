//! Phone verification with one-time codes.
//!
//! State lives in an injected [`VerificationStore`] keyed by `(phone, ip)`.
//! Every window is checked against explicit timestamps; the store TTL only
//! bounds how long a record is retained.
//!
//! Limits per key: 3 codes per 10 minutes, each code valid for 10 minutes
//! and 5 attempts, a successful verification valid for 30 minutes.

use crate::validation::{constant_time_eq, mask_phone, normalize_phone};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const MAX_SENDS_PER_WINDOW: usize = 3;
pub const SEND_WINDOW_SECS: i64 = 10 * 60;
pub const CODE_TTL_SECS: i64 = 10 * 60;
pub const MAX_ATTEMPTS: u32 = 5;
pub const VERIFIED_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("too many codes requested, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },
    #[error("no pending verification code")]
    NoPendingCode,
    #[error("verification code expired")]
    CodeExpired,
    #[error("incorrect code, {remaining_attempts} attempts left")]
    InvalidCode { remaining_attempts: u32 },
    #[error("too many failed attempts")]
    TooManyAttempts,
    #[error("could not deliver code: {0}")]
    Delivery(String),
}

/// Verification state for one `(phone, ip)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationRecord {
    pub code_hash: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub sends: Vec<DateTime<Utc>>,
    pub verified_until: Option<DateTime<Utc>>,
}

impl VerificationRecord {
    fn prune_sends(&mut self, now: DateTime<Utc>) {
        let window_start = now - ChronoDuration::seconds(SEND_WINDOW_SECS);
        self.sends.retain(|sent_at| *sent_at > window_start);
    }

    /// How long the record still carries information.
    fn retention(&self, now: DateTime<Utc>) -> Duration {
        let horizon = [
            self.sends
                .iter()
                .max()
                .map(|last| *last + ChronoDuration::seconds(SEND_WINDOW_SECS)),
            self.code_expires_at,
            self.verified_until,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(now);
        (horizon - now).to_std().unwrap_or_default().max(Duration::from_secs(1))
    }
}

/// Time-windowed key/value store holding verification state.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<VerificationRecord>;
    async fn set(&self, key: &str, value: VerificationRecord, ttl: Duration);
    async fn expire(&self, key: &str);
}

struct PerEntryTtl;

impl Expiry<String, (VerificationRecord, Duration)> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(VerificationRecord, Duration),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &(VerificationRecord, Duration),
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

/// In-process store on a moka cache with per-entry TTL.
#[derive(Clone)]
pub struct MokaVerificationStore {
    cache: Cache<String, (VerificationRecord, Duration)>,
}

impl MokaVerificationStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MokaVerificationStore {
    fn default() -> Self {
        Self::new(50_000)
    }
}

#[async_trait]
impl VerificationStore for MokaVerificationStore {
    async fn get(&self, key: &str) -> Option<VerificationRecord> {
        self.cache.get(key).await.map(|(record, _)| record)
    }

    async fn set(&self, key: &str, value: VerificationRecord, ttl: Duration) {
        self.cache.insert(key.to_string(), (value, ttl)).await;
    }

    async fn expire(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}

/// Delivers codes to phones. The SMS wire format is left to implementations.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_code(&self, phone: &str, code: &str) -> Result<(), VerificationError>;
}

/// Logs codes instead of sending them. Used when no SMS gateway is configured.
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send_code(&self, phone: &str, code: &str) -> Result<(), VerificationError> {
        tracing::info!("Verification code issued for {}", mask_phone(phone));
        tracing::debug!("Verification code for {}: {}", mask_phone(phone), code);
        Ok(())
    }
}

/// Result of a successful code request.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCode {
    pub phone: String,
    pub expires_at: DateTime<Utc>,
    pub sends_remaining: usize,
}

fn record_key(phone: &str, ip: &str) -> String {
    format!("{}|{}", phone, ip)
}

fn hash_code(key: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_code() -> String {
    format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
}

#[derive(Clone)]
pub struct PhoneVerifier {
    store: Arc<dyn VerificationStore>,
    sms: Arc<dyn SmsSender>,
}

impl PhoneVerifier {
    pub fn new(store: Arc<dyn VerificationStore>, sms: Arc<dyn SmsSender>) -> Self {
        Self { store, sms }
    }

    /// Issue and deliver a fresh code, replacing any pending one.
    pub async fn request_code(
        &self,
        phone: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, VerificationError> {
        let phone = normalize_phone(phone).ok_or(VerificationError::InvalidPhone)?;
        let key = record_key(&phone, ip);

        let mut record = self.store.get(&key).await.unwrap_or_default();
        record.prune_sends(now);
        if record.sends.len() >= MAX_SENDS_PER_WINDOW {
            let oldest = record.sends.iter().min().copied().unwrap_or(now);
            let retry_after = oldest + ChronoDuration::seconds(SEND_WINDOW_SECS) - now;
            tracing::warn!("OTP rate limit reached for {}", mask_phone(&phone));
            return Err(VerificationError::RateLimited {
                retry_after_secs: retry_after.num_seconds().max(1),
            });
        }

        let code = generate_code();
        let expires_at = now + ChronoDuration::seconds(CODE_TTL_SECS);
        record.code_hash = Some(hash_code(&key, &code));
        record.code_expires_at = Some(expires_at);
        record.attempts = 0;
        record.sends.push(now);
        let sends_remaining = MAX_SENDS_PER_WINDOW - record.sends.len();
        let ttl = record.retention(now);
        self.store.set(&key, record, ttl).await;

        self.sms.send_code(&phone, &code).await?;

        Ok(IssuedCode {
            phone,
            expires_at,
            sends_remaining,
        })
    }

    /// Check a submitted code. Success marks the pair verified.
    pub async fn verify_code(
        &self,
        phone: &str,
        ip: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let phone = normalize_phone(phone).ok_or(VerificationError::InvalidPhone)?;
        let key = record_key(&phone, ip);

        let mut record = self
            .store
            .get(&key)
            .await
            .ok_or(VerificationError::NoPendingCode)?;
        let (Some(expected), Some(expires_at)) = (record.code_hash.clone(), record.code_expires_at)
        else {
            return Err(VerificationError::NoPendingCode);
        };

        if now >= expires_at {
            record.code_hash = None;
            record.code_expires_at = None;
            let ttl = record.retention(now);
            self.store.set(&key, record, ttl).await;
            return Err(VerificationError::CodeExpired);
        }

        record.attempts += 1;
        if constant_time_eq(&hash_code(&key, code.trim()), &expected) {
            record.code_hash = None;
            record.code_expires_at = None;
            record.attempts = 0;
            record.verified_until = Some(now + ChronoDuration::seconds(VERIFIED_TTL_SECS));
            let ttl = record.retention(now);
            self.store.set(&key, record, ttl).await;
            tracing::info!("Phone {} verified", mask_phone(&phone));
            return Ok(());
        }

        let remaining_attempts = MAX_ATTEMPTS.saturating_sub(record.attempts);
        if remaining_attempts == 0 {
            record.code_hash = None;
            record.code_expires_at = None;
        }
        let ttl = record.retention(now);
        self.store.set(&key, record, ttl).await;

        if remaining_attempts == 0 {
            Err(VerificationError::TooManyAttempts)
        } else {
            Err(VerificationError::InvalidCode { remaining_attempts })
        }
    }

    pub async fn is_verified(&self, phone: &str, ip: &str, now: DateTime<Utc>) -> bool {
        let Some(phone) = normalize_phone(phone) else {
            return false;
        };
        self.store
            .get(&record_key(&phone, ip))
            .await
            .and_then(|record| record.verified_until)
            .is_some_and(|until| now < until)
    }

    /// Drop all state for the pair.
    pub async fn reset(&self, phone: &str, ip: &str) {
        if let Some(phone) = normalize_phone(phone) {
            self.store.expire(&record_key(&phone, ip)).await;
        }
    }
}
