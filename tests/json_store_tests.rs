/// JSON file store behaviour
mod common;

use chrono::{Duration, Utc};
use common::{lead_input, provider_input, temp_repositories};
use punto_seguro_api::json_store::JsonStore;
use punto_seguro_api::models::{
    CollaboratorInput, CreateContext, LeadPatch, LeadStatus, ProviderInput, StringList,
    ValidationError, DEFAULT_DAILY_CAP, DEFAULT_PROVIDER_PRIORITY,
};
use punto_seguro_api::repository::{
    CollaboratorRepository, LeadRepository, ProviderRepository, RepositoryError,
};

#[tokio::test]
async fn data_survives_reopening_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let created = {
        let store = JsonStore::new(dir.path());
        LeadRepository::create(
            &store,
            lead_input("Toledo", "45001", "vivienda"),
            CreateContext::new(Some("10.0.0.8".to_string())),
        )
        .await
        .unwrap()
    };

    let reopened = JsonStore::new(dir.path());
    let found = LeadRepository::get_by_id(&reopened, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, created);
    assert_eq!(found.consent_ip.as_deref(), Some("10.0.0.8"));
    assert!(dir.path().join("leads.json").exists());
}

#[tokio::test]
async fn missing_files_read_as_empty() {
    let (_dir, repos) = temp_repositories();
    assert!(repos.leads.list().await.unwrap().is_empty());
    assert!(repos.providers.list().await.unwrap().is_empty());
    assert!(repos.events.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn leads_are_listed_newest_first() {
    let (_dir, repos) = temp_repositories();
    let mut older_ctx = CreateContext::new(None);
    older_ctx.now = Utc::now() - Duration::hours(2);
    let older = repos
        .leads
        .create(lead_input("Ávila", "05001", "vivienda"), older_ctx)
        .await
        .unwrap();
    let newer = repos
        .leads
        .create(lead_input("Segovia", "40001", "vivienda"), CreateContext::new(None))
        .await
        .unwrap();

    let ids: Vec<String> = repos
        .leads
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.id)
        .collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}

#[tokio::test]
async fn update_revalidates_and_keeps_stored_lead_on_error() {
    let (_dir, repos) = temp_repositories();
    let lead = repos
        .leads
        .create(lead_input("León", "24001", "vivienda"), CreateContext::new(None))
        .await
        .unwrap();

    let err = repos
        .leads
        .update(
            &lead.id,
            LeadPatch {
                provider_ids: Some(vec!["p1".to_string()]),
                assigned_provider_id: Some(Some("p2".to_string())),
                ..LeadPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::Validation(ValidationError::UnknownAssignedProvider(_))
    ));

    let stored = repos.leads.get_by_id(&lead.id).await.unwrap().unwrap();
    assert!(stored.provider_ids.is_empty());

    let updated = repos
        .leads
        .update(&lead.id, LeadPatch::status(LeadStatus::Sold))
        .await
        .unwrap()
        .unwrap();
    assert!(updated.sold_at.is_some());
    assert!(updated.updated_at.is_some());

    assert!(repos
        .leads
        .update("missing", LeadPatch::default())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn daily_count_uses_creation_date_and_provider_ids() {
    let (_dir, repos) = temp_repositories();
    let today = Utc::now();

    for (offset_days, provider) in [(0, "p1"), (0, "p1"), (0, "p2"), (-1, "p1")] {
        let mut ctx = CreateContext::new(None);
        ctx.now = today + Duration::days(offset_days);
        let lead = repos
            .leads
            .create(lead_input("Jaén", "23001", "vivienda"), ctx)
            .await
            .unwrap();
        repos
            .leads
            .update(
                &lead.id,
                LeadPatch {
                    provider_ids: Some(vec![provider.to_string()]),
                    ..LeadPatch::default()
                },
            )
            .await
            .unwrap();
    }

    let date = today.date_naive();
    assert_eq!(
        repos.leads.count_assigned_for_provider_on_date("p1", date).await.unwrap(),
        2
    );
    assert_eq!(
        repos.leads.count_assigned_for_provider_on_date("p2", date).await.unwrap(),
        1
    );
    assert_eq!(
        repos.leads.count_assigned_for_provider_on_date("p3", date).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn provider_updates_merge_over_existing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path());
    let created = ProviderRepository::create(
        &store,
        ProviderInput {
            zones: None,
            ..provider_input("Seguridad Ébano", &[], &[], 5)
        },
    )
    .await
    .unwrap();
    assert!(created.zones.is_empty());

    let updated = ProviderRepository::update(
        &store,
        &created.id,
        ProviderInput {
            zones: Some(StringList::Joined("Málaga, 29001 ,malaga".to_string())),
            daily_cap: Some(0),
            ..ProviderInput::default()
        },
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(updated.name, "Seguridad Ébano");
    assert_eq!(updated.priority, 5);
    assert_eq!(updated.zones, vec!["malaga".to_string(), "29001".to_string()]);
    assert_eq!(updated.daily_cap, 1);
}

#[tokio::test]
async fn duplicate_ids_and_tracking_codes_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path());

    let input = ProviderInput {
        id: Some("fixed-id".to_string()),
        ..provider_input("Duplicado", &[], &[], 1)
    };
    ProviderRepository::create(&store, input.clone()).await.unwrap();
    let err = ProviderRepository::create(&store, input).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict(_)));

    let collaborator = CollaboratorInput {
        name: Some("Agencia".to_string()),
        tracking_code: Some("agencia".to_string()),
        ..CollaboratorInput::default()
    };
    let stored = CollaboratorRepository::create(&store, collaborator.clone())
        .await
        .unwrap();
    assert_eq!(stored.tracking_code, "AGENCIA");
    let err = CollaboratorRepository::create(&store, collaborator)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict(_)));

    let found = store.find_by_tracking_code(" agencia ").await.unwrap().unwrap();
    assert_eq!(found.id, stored.id);
}

#[tokio::test]
async fn touch_assigned_at_only_updates_listed_providers() {
    let (_dir, repos) = temp_repositories();
    let a = repos
        .providers
        .create(provider_input("Tocado", &[], &[], 1))
        .await
        .unwrap();
    let b = repos
        .providers
        .create(provider_input("Intacto", &[], &[], 1))
        .await
        .unwrap();

    let at = Utc::now();
    repos
        .providers
        .touch_assigned_at(&[a.id.clone()], at)
        .await
        .unwrap();

    let a = repos.providers.get_by_id(&a.id).await.unwrap().unwrap();
    let b = repos.providers.get_by_id(&b.id).await.unwrap().unwrap();
    assert_eq!(a.last_assigned_at, Some(at));
    assert!(b.last_assigned_at.is_none());
}

#[tokio::test]
async fn provider_records_without_optional_fields_load_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("providers.json"),
        r#"[{"id": "legacy", "name": "Alarmas Antiguas", "email": "info@antiguas.example"}]"#,
    )
    .unwrap();

    let store = JsonStore::new(dir.path());
    let providers = ProviderRepository::list(&store).await.unwrap();
    assert_eq!(providers.len(), 1);
    let legacy = &providers[0];
    assert!(legacy.active);
    assert_eq!(legacy.priority, DEFAULT_PROVIDER_PRIORITY);
    assert_eq!(legacy.daily_cap, DEFAULT_DAILY_CAP);
    assert!(legacy.zones.is_empty());
    assert!(legacy.last_assigned_at.is_none());

    let active = ProviderRepository::list_active(&store).await.unwrap();
    assert_eq!(active.len(), 1);
}
