//! External service integrations.

pub mod notifications {
    pub use crate::notifications::*;
}

pub mod verification {
    pub use crate::verification::*;
}

use crate::config::Config;
use crate::notifications::{HttpRelayMailer, Mailer, NotificationService, OutboxMailer};
use std::sync::Arc;

/// Email notifier on the relay when one is configured, on the outbox log otherwise.
pub fn build_notifier(config: &Config) -> anyhow::Result<NotificationService> {
    let mailer: Arc<dyn Mailer> = match &config.email_relay_url {
        Some(url) => {
            tracing::info!("✓ Email relay client initialized: {}", url);
            Arc::new(HttpRelayMailer::new(
                url.clone(),
                config.email_relay_token.clone(),
            )?)
        }
        None => {
            tracing::info!("Emails go to the outbox log in {}", config.data_dir.display());
            Arc::new(OutboxMailer::new(&config.data_dir))
        }
    };
    Ok(NotificationService::new(mailer, config.email_from.clone()))
}
