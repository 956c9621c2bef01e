/// Provider selection: eligibility filters and fairness ordering
mod common;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use common::{lead_input, provider_input};
use punto_seguro_api::assignment::{select_providers, DailyCountLookup};
use punto_seguro_api::models::{CreateContext, Lead, Provider, ProviderInput};
use punto_seguro_api::repository::{RepoResult, RepositoryError};
use std::collections::HashMap;

#[derive(Default)]
struct FixedCounts(HashMap<String, u32>);

#[async_trait]
impl DailyCountLookup for FixedCounts {
    async fn daily_count(&self, provider_id: &str, _date: NaiveDate) -> RepoResult<u32> {
        Ok(self.0.get(provider_id).copied().unwrap_or(0))
    }
}

struct BrokenLookup;

#[async_trait]
impl DailyCountLookup for BrokenLookup {
    async fn daily_count(&self, _provider_id: &str, _date: NaiveDate) -> RepoResult<u32> {
        Err(RepositoryError::Conflict("lookup unavailable".to_string()))
    }
}

fn lead(city: &str, postal_code: &str, business_type: &str) -> Lead {
    Lead::from_input(
        lead_input(city, postal_code, business_type),
        CreateContext::new(None),
    )
    .unwrap()
}

fn provider(id: &str, input: ProviderInput) -> Provider {
    Provider::from_input(
        ProviderInput {
            id: Some(id.to_string()),
            ..input
        },
        None,
    )
    .unwrap()
}

fn ids(providers: &[Provider]) -> Vec<&str> {
    providers.iter().map(|p| p.id.as_str()).collect()
}

#[tokio::test]
async fn postal_zone_selects_only_matching_provider() {
    let lead = lead("Barcelona", "08001", "vivienda");
    let candidates = vec![
        provider("p1", provider_input("Uno", &["08001"], &[], 100)),
        provider("p2", provider_input("Dos", &["28001"], &[], 100)),
    ];

    let selected = select_providers(&lead, &candidates, &FixedCounts::default(), 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(ids(&selected), vec!["p1"]);
}

#[tokio::test]
async fn city_zone_matches_ignoring_case_and_accents() {
    let lead = lead("Gavà", "08850", "Comercio");
    let candidates = vec![
        provider("gava", provider_input("Gava", &["GAVA"], &["comercio"], 100)),
        provider("viv", provider_input("Solo Vivienda", &["gava"], &["vivienda"], 100)),
    ];

    let selected = select_providers(&lead, &candidates, &FixedCounts::default(), 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(ids(&selected), vec!["gava"]);
}

#[tokio::test]
async fn providers_without_zones_or_types_match_everything() {
    let lead = lead("Cáceres", "10001", "oficina");
    let candidates = vec![provider("any", provider_input("Comodín", &[], &[], 100))];
    let selected = select_providers(&lead, &candidates, &FixedCounts::default(), 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(ids(&selected), vec!["any"]);
}

#[tokio::test]
async fn inactive_and_capped_providers_are_skipped() {
    let lead = lead("Madrid", "28001", "vivienda");
    let candidates = vec![
        provider(
            "off",
            ProviderInput {
                active: Some(false),
                ..provider_input("Apagado", &[], &[], 1)
            },
        ),
        provider(
            "full",
            ProviderInput {
                daily_cap: Some(3),
                ..provider_input("Lleno", &[], &[], 1)
            },
        ),
        provider("ok", provider_input("Disponible", &[], &[], 50)),
    ];
    let counts = FixedCounts(HashMap::from([("full".to_string(), 3)]));

    let selected = select_providers(&lead, &candidates, &counts, 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(ids(&selected), vec!["ok"]);
}

#[tokio::test]
async fn order_is_last_assigned_then_priority_then_name() {
    let lead = lead("Madrid", "28001", "vivienda");
    let yesterday = Utc::now() - Duration::days(1);
    let recent = provider(
        "recent",
        ProviderInput {
            last_assigned_at: Some(yesterday),
            ..provider_input("Aaa Reciente", &[], &[], 1)
        },
    );
    let low_priority = provider("low", provider_input("Zeta", &[], &[], 200));
    let high_b = provider("b", provider_input("Beta", &[], &[], 10));
    let high_a = provider("a", provider_input("Álvarez", &[], &[], 10));

    let candidates = vec![recent, low_priority, high_b, high_a];
    let selected = select_providers(&lead, &candidates, &FixedCounts::default(), 4, Utc::now())
        .await
        .unwrap();
    assert_eq!(ids(&selected), vec!["a", "b", "low", "recent"]);
}

#[tokio::test]
async fn selection_is_truncated_and_deterministic() {
    let lead = lead("Madrid", "28001", "vivienda");
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
    let candidates: Vec<Provider> = (0..5)
        .map(|i| provider(&format!("p{i}"), provider_input(&format!("Prov {i}"), &[], &[], 100 - i)))
        .collect();

    let first = select_providers(&lead, &candidates, &FixedCounts::default(), 2, now)
        .await
        .unwrap();
    let mut reversed = candidates.clone();
    reversed.reverse();
    let second = select_providers(&lead, &reversed, &FixedCounts::default(), 2, now)
        .await
        .unwrap();

    assert_eq!(ids(&first), vec!["p4", "p3"]);
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn lookup_failures_propagate() {
    let lead = lead("Madrid", "28001", "vivienda");
    let candidates = vec![provider("p1", provider_input("Uno", &[], &[], 1))];
    let result = select_providers(&lead, &candidates, &BrokenLookup, 2, Utc::now()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn empty_pool_is_not_an_error() {
    let lead = lead("Madrid", "28001", "vivienda");
    let selected = select_providers(&lead, &[], &FixedCounts::default(), 2, Utc::now())
        .await
        .unwrap();
    assert!(selected.is_empty());
}
