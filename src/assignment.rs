//! Provider selection for a lead.
//!
//! Filters the candidate pool by activity, zone, business type and daily
//! capacity, then orders the survivors for round-robin fairness: least
//! recently assigned first, then lower `priority`, then name.

use crate::models::{Lead, Provider};
use crate::repository::{LeadRepository, RepoResult};
use crate::validation::{normalize_postal_code, normalize_token};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::cmp::Ordering;

/// How many leads a provider already received on a given day.
#[async_trait]
pub trait DailyCountLookup: Send + Sync {
    async fn daily_count(&self, provider_id: &str, date: NaiveDate) -> RepoResult<u32>;
}

#[async_trait]
impl<T> DailyCountLookup for T
where
    T: LeadRepository + ?Sized,
{
    async fn daily_count(&self, provider_id: &str, date: NaiveDate) -> RepoResult<u32> {
        self.count_assigned_for_provider_on_date(provider_id, date)
            .await
    }
}

/// Zone match: no zones means any lead; otherwise the lead's city or postal
/// code must equal one of the zone tokens after normalization.
pub fn zone_matches(lead: &Lead, provider: &Provider) -> bool {
    if provider.zones.is_empty() {
        return true;
    }

    let city = normalize_token(&lead.city);
    let postal_code = normalize_postal_code(&lead.postal_code);

    provider.zones.iter().any(|zone| {
        let zone = normalize_token(zone);
        !zone.is_empty() && (zone == city || zone == postal_code)
    })
}

/// Type match: no business types means any lead.
pub fn type_matches(lead: &Lead, provider: &Provider) -> bool {
    if provider.business_types.is_empty() {
        return true;
    }
    let lead_type = normalize_token(&lead.business_type);
    provider
        .business_types
        .iter()
        .any(|t| normalize_token(t) == lead_type)
}

fn last_assigned_millis(provider: &Provider) -> i64 {
    provider
        .last_assigned_at
        .map(|at| at.timestamp_millis())
        .unwrap_or(0)
}

/// Fairness order used to rank eligible providers.
pub fn compare_assignment_order(a: &Provider, b: &Provider) -> Ordering {
    last_assigned_millis(a)
        .cmp(&last_assigned_millis(b))
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| normalize_token(&a.name).cmp(&normalize_token(&b.name)))
        .then_with(|| a.name.cmp(&b.name))
}

/// Select at most `max_providers` providers for `lead`.
///
/// An empty result is a normal outcome. Only lookup failures are errors.
pub async fn select_providers<L>(
    lead: &Lead,
    candidates: &[Provider],
    lookup: &L,
    max_providers: usize,
    now: DateTime<Utc>,
) -> RepoResult<Vec<Provider>>
where
    L: DailyCountLookup + ?Sized,
{
    let today = now.date_naive();
    let mut eligible = Vec::new();

    for provider in candidates {
        if !provider.active || !zone_matches(lead, provider) || !type_matches(lead, provider) {
            continue;
        }

        let assigned_today = lookup.daily_count(&provider.id, today).await?;
        if i64::from(assigned_today) >= i64::from(provider.daily_cap) {
            tracing::debug!(
                "Provider {} at daily cap ({}/{})",
                provider.id,
                assigned_today,
                provider.daily_cap
            );
            continue;
        }

        tracing::debug!(
            "Provider {} eligible for lead {} (assigned today: {})",
            provider.id,
            lead.id,
            assigned_today
        );
        eligible.push(provider.clone());
    }

    eligible.sort_by(compare_assignment_order);
    eligible.truncate(max_providers);

    Ok(eligible)
}
