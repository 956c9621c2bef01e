//! Provider and requester notifications.
//!
//! [`LeadNotifier`] is what the pipeline calls. [`NotificationService`]
//! renders the Spanish templates and hands the message to a [`Mailer`]:
//! either [`OutboxMailer`] (appends to `email-outbox.log`, the default for
//! local runs) or [`HttpRelayMailer`] (POSTs to an HTTP relay behind a
//! circuit breaker).

use crate::circuit_breaker::{delivery_breaker, guarded, DeliveryBreaker, Guarded};
use crate::models::{Lead, Provider};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const DEFAULT_FROM: &str = "Punto Seguro <no-reply@puntoseguro.local>";

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("recipient address is empty")]
    MissingRecipient,
    #[error("email relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("email relay returned {status}: {body}")]
    RelayStatus { status: u16, body: String },
    #[error("email relay unavailable (circuit open)")]
    CircuitOpen,
    #[error("outbox write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), NotificationError>;

    /// Short transport label recorded in `lead_sent` events.
    fn mode(&self) -> &'static str;
}

/// Appends every message to a plain-text log.
pub struct OutboxMailer {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutboxMailer {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("email-outbox.log"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), NotificationError> {
        let entry = format!(
            "--- {} ---\nTO: {}\nSUBJECT: {}\n{}\n\n",
            Utc::now().to_rfc3339(),
            email.to,
            email.subject,
            email.text
        );

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "outbox"
    }
}

/// Delivers messages through an HTTP email relay.
#[derive(Clone)]
pub struct HttpRelayMailer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    breaker: DeliveryBreaker,
}

impl HttpRelayMailer {
    /// Creates a new relay mailer.
    ///
    /// # Arguments
    ///
    /// * `url` - Endpoint receiving `{from, to, subject, text}` as JSON.
    /// * `token` - Optional bearer token.
    pub fn new(url: String, token: Option<String>) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            url,
            token,
            breaker: delivery_breaker(),
        })
    }
}

#[async_trait]
impl Mailer for HttpRelayMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(email);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let attempt = async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(NotificationError::RelayStatus { status, body });
            }
            Ok::<(), NotificationError>(())
        };

        match guarded(&self.breaker, "email relay", attempt).await {
            Ok(()) => {
                tracing::debug!("Relay accepted email to {}", email.to);
                Ok(())
            }
            Err(Guarded::Failed(e)) => Err(e),
            Err(Guarded::Rejected) => Err(NotificationError::CircuitOpen),
        }
    }

    fn mode(&self) -> &'static str {
        "relay"
    }
}

/// Notifications emitted by the lead pipeline.
#[async_trait]
pub trait LeadNotifier: Send + Sync {
    async fn send_provider_lead_email(
        &self,
        provider: &Provider,
        lead: &Lead,
    ) -> Result<(), NotificationError>;

    async fn send_user_confirmation_email(
        &self,
        lead: &Lead,
        provider_count: usize,
    ) -> Result<(), NotificationError>;

    fn mode(&self) -> &'static str;
}

pub fn provider_subject(lead: &Lead) -> String {
    format!(
        "Nuevo contacto Punto Seguro (riesgo {} - {})",
        lead.risk_level, lead.city
    )
}

pub fn provider_body(lead: &Lead) -> String {
    let notes = if lead.notes.trim().is_empty() {
        "Sin notas adicionales"
    } else {
        lead.notes.as_str()
    };
    [
        "Nuevo lead asignado por Punto Seguro".to_string(),
        String::new(),
        format!("Nombre: {}", lead.name),
        format!("Email: {}", lead.email),
        format!("Telefono: {}", lead.phone),
        format!("Ciudad: {}", lead.city),
        format!("Codigo postal: {}", lead.postal_code),
        format!("Tipo de inmueble/negocio: {}", lead.business_type),
        format!("Riesgo: {}", lead.risk_level),
        format!("Urgencia: {}", lead.urgency),
        format!("Presupuesto: {}", lead.budget_range),
        format!("Notas del usuario: {}", notes),
        String::new(),
        "Resumen de evaluacion:".to_string(),
        lead.evaluation_summary_text(),
        String::new(),
        "Contacto generado en Punto Seguro.".to_string(),
    ]
    .join("\n")
}

pub fn user_subject() -> String {
    "Confirmacion de solicitud - Punto Seguro".to_string()
}

pub fn user_body(lead: &Lead, provider_count: usize) -> String {
    [
        format!("Hola {},", lead.name),
        String::new(),
        format!(
            "Hemos enviado tu solicitud a hasta {} proveedores seleccionados para tu zona.",
            provider_count
        ),
        String::new(),
        "Resumen de tu solicitud:".to_string(),
        format!("Ciudad: {}", lead.city),
        format!("Codigo postal: {}", lead.postal_code),
        format!("Riesgo orientativo: {}", lead.risk_level),
        format!("Urgencia: {}", lead.urgency),
        format!("Presupuesto: {}", lead.budget_range),
        String::new(),
        "Gracias por usar Punto Seguro.".to_string(),
    ]
    .join("\n")
}

/// Template renderer in front of a [`Mailer`].
#[derive(Clone)]
pub struct NotificationService {
    mailer: Arc<dyn Mailer>,
    from: String,
}

impl NotificationService {
    pub fn new(mailer: Arc<dyn Mailer>, from: impl Into<String>) -> Self {
        Self {
            mailer,
            from: from.into(),
        }
    }

    async fn deliver(&self, to: &str, subject: String, text: String) -> Result<(), NotificationError> {
        if to.trim().is_empty() {
            return Err(NotificationError::MissingRecipient);
        }
        let email = OutgoingEmail {
            from: self.from.clone(),
            to: to.to_string(),
            subject,
            text,
        };
        self.mailer.send(&email).await
    }
}

#[async_trait]
impl LeadNotifier for NotificationService {
    async fn send_provider_lead_email(
        &self,
        provider: &Provider,
        lead: &Lead,
    ) -> Result<(), NotificationError> {
        tracing::info!("Emailing lead {} to provider {}", lead.id, provider.id);
        self.deliver(&provider.email, provider_subject(lead), provider_body(lead))
            .await
    }

    async fn send_user_confirmation_email(
        &self,
        lead: &Lead,
        provider_count: usize,
    ) -> Result<(), NotificationError> {
        self.deliver(&lead.email, user_subject(), user_body(lead, provider_count))
            .await
    }

    fn mode(&self) -> &'static str {
        self.mailer.mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateContext, LeadInput};

    fn lead() -> Lead {
        Lead::from_input(
            LeadInput {
                name: Some("Marta".into()),
                email: Some("marta@example.com".into()),
                phone: Some("+34 655 123 456".into()),
                city: Some("Sevilla".into()),
                postal_code: Some("41001".into()),
                risk_level: Some("alto".into()),
                consent: true,
                ..LeadInput::default()
            },
            CreateContext::new(None),
        )
        .unwrap()
    }

    #[test]
    fn provider_template_lists_lead_fields() {
        let lead = lead();
        assert_eq!(
            provider_subject(&lead),
            "Nuevo contacto Punto Seguro (riesgo High - Sevilla)"
        );
        let body = provider_body(&lead);
        assert!(body.contains("Codigo postal: 41001"));
        assert!(body.contains("Notas del usuario: Sin notas adicionales"));
        assert!(body.contains("No informado"));
    }

    #[test]
    fn user_template_mentions_provider_count() {
        let body = user_body(&lead(), 2);
        assert!(body.starts_with("Hola Marta,"));
        assert!(body.contains("hasta 2 proveedores"));
    }

    #[tokio::test]
    async fn outbox_mailer_appends_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mailer = OutboxMailer::new(dir.path());
        let service = NotificationService::new(Arc::new(mailer), DEFAULT_FROM);

        service.send_user_confirmation_email(&lead(), 2).await.unwrap();
        service.send_user_confirmation_email(&lead(), 1).await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("email-outbox.log")).unwrap();
        assert_eq!(log.matches("TO: marta@example.com").count(), 2);
        assert!(log.contains("SUBJECT: Confirmacion de solicitud - Punto Seguro"));
    }

    #[tokio::test]
    async fn empty_recipient_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = NotificationService::new(Arc::new(OutboxMailer::new(dir.path())), DEFAULT_FROM);
        let mut lead = lead();
        lead.email.clear();
        let err = service.send_user_confirmation_email(&lead, 2).await.unwrap_err();
        assert!(matches!(err, NotificationError::MissingRecipient));
    }
}
