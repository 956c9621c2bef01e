use crate::models::LeadEvent;
use crate::repository::{EventRepository, RepoResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const LEAD_SUBMITTED: &str = "lead_submitted";
pub const LEAD_ASSIGNED: &str = "lead_assigned";
pub const LEAD_SENT: &str = "lead_sent";
pub const LEAD_REASSIGNED_AUTO: &str = "lead_reassigned_auto";
pub const LEAD_ASSIGNED_MANUAL: &str = "lead_assigned_manual";
pub const LEAD_ANONYMIZED: &str = "lead_anonymized";
pub const LEAD_COLLABORATOR_CHANGED: &str = "lead_collaborator_changed";
pub const PROVIDER_DELETED: &str = "provider_deleted";

/// Who triggered an event and from where.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl EventContext {
    pub fn admin(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            actor: Some("admin".to_string()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Stamp and append one audit event.
pub async fn track_event(
    events: &dyn EventRepository,
    event_name: &str,
    payload: Value,
    context: Value,
) -> RepoResult<LeadEvent> {
    let event = LeadEvent {
        id: Uuid::new_v4().to_string(),
        event_name: event_name.to_string(),
        timestamp: Utc::now(),
        payload,
        context,
    };
    tracing::debug!("Tracking event {} ({})", event.event_name, event.id);
    events.append(event).await
}
