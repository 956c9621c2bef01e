/// Lead pipeline tests against the JSON store and a recording notifier
mod common;

use common::{
    lead_input, provider_input, temp_repositories, BrokenEvents, FailingLeadUpdates,
    RecordingNotifier, Sent,
};
use punto_seguro_api::events::{self, EventContext};
use punto_seguro_api::models::{
    AssignmentMode, CollaboratorInput, LeadEvent, LeadStatus, ProviderInput,
};
use punto_seguro_api::orchestrator::{LeadOrchestrator, LeadSubmission, PipelineError};
use punto_seguro_api::repository::Repositories;
use std::sync::Arc;

fn orchestrator(repos: &Repositories, notifier: &Arc<RecordingNotifier>, max: usize) -> LeadOrchestrator {
    LeadOrchestrator::new(repos.clone(), notifier.clone(), max)
}

fn submission(city: &str, postal_code: &str) -> LeadSubmission {
    LeadSubmission {
        input: lead_input(city, postal_code, "vivienda"),
        requester_ip: Some("198.51.100.4".to_string()),
        phone_verified: false,
    }
}

fn admin() -> EventContext {
    EventContext::admin("/api/admin/test")
}

async fn event_names(repos: &Repositories) -> Vec<String> {
    let mut names: Vec<String> = repos
        .events
        .list(100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn submission_with_matching_providers_is_sent() {
    let (_dir, repos) = temp_repositories();
    let a = repos
        .providers
        .create(provider_input("Alarmas Norte", &["08001"], &["vivienda"], 10))
        .await
        .unwrap();
    let b = repos
        .providers
        .create(provider_input("Seguridad Sur", &["barcelona"], &[], 20))
        .await
        .unwrap();
    repos
        .providers
        .create(provider_input("Lejos SL", &["28001"], &[], 1))
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let outcome = orchestrator(&repos, &notifier, 2)
        .submit(submission("Barcelona", "08001"))
        .await
        .unwrap();

    assert_eq!(outcome.lead.status, LeadStatus::Sent);
    assert_eq!(outcome.lead.provider_ids, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(outcome.lead.assigned_provider_id.as_deref(), Some(a.id.as_str()));
    assert_eq!(outcome.lead.assignment_mode, AssignmentMode::Auto);
    assert_eq!(notifier.provider_emails(), vec![a.id.clone(), b.id.clone()]);
    assert!(notifier.sent().contains(&Sent::Confirmation {
        lead_id: outcome.lead.id.clone(),
        provider_count: 2,
    }));

    let stored = repos.leads.get_by_id(&outcome.lead.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LeadStatus::Sent);

    let touched = repos.providers.get_by_id(&a.id).await.unwrap().unwrap();
    assert!(touched.last_assigned_at.is_some());

    assert_eq!(
        event_names(&repos).await,
        vec![events::LEAD_ASSIGNED, events::LEAD_SENT, events::LEAD_SUBMITTED]
    );
}

#[tokio::test]
async fn submission_without_providers_stays_validated() {
    let (_dir, repos) = temp_repositories();
    repos
        .providers
        .create(provider_input("Madrid Seguro", &["madrid"], &[], 10))
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let outcome = orchestrator(&repos, &notifier, 2)
        .submit(submission("Sevilla", "41001"))
        .await
        .unwrap();

    assert_eq!(outcome.lead.status, LeadStatus::Validated);
    assert!(outcome.lead.provider_ids.is_empty());
    assert!(outcome.lead.assigned_provider_id.is_none());
    assert!(notifier.provider_emails().is_empty());
    assert_eq!(notifier.confirmations(), 1);

    let sent_event = repos
        .events
        .list(10)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.event_name == events::LEAD_SENT)
        .unwrap();
    assert_eq!(sent_event.payload["provider_count"], 0);
    assert_eq!(sent_event.payload["email_mode"], "recording");
}

#[tokio::test]
async fn failing_provider_email_does_not_stop_the_others() {
    let (_dir, repos) = temp_repositories();
    let first = repos
        .providers
        .create(provider_input("Primero", &[], &[], 1))
        .await
        .unwrap();
    let second = repos
        .providers
        .create(provider_input("Segundo", &[], &[], 2))
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    notifier.fail_for(&first.id);

    let outcome = orchestrator(&repos, &notifier, 2)
        .submit(submission("Valencia", "46001"))
        .await
        .unwrap();

    assert_eq!(outcome.lead.status, LeadStatus::Sent);
    assert_eq!(notifier.provider_emails(), vec![second.id]);
    assert_eq!(notifier.confirmations(), 1);
}

#[tokio::test]
async fn invalid_submission_is_rejected_before_anything_is_stored() {
    let (_dir, repos) = temp_repositories();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut bad = submission("Bilbao", "48001");
    bad.input.consent = false;

    let err = orchestrator(&repos, &notifier, 2).submit(bad).await.unwrap_err();
    assert!(matches!(err, PipelineError::Repository(_)));
    assert!(repos.leads.list().await.unwrap().is_empty());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn round_robin_rotates_between_submissions() {
    let (_dir, repos) = temp_repositories();
    let a = repos
        .providers
        .create(provider_input("Ana Alarmas", &[], &[], 10))
        .await
        .unwrap();
    let b = repos
        .providers
        .create(provider_input("Beta Seguridad", &[], &[], 20))
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 1);
    let first = orch.submit(submission("Girona", "17001")).await.unwrap();
    let second = orch.submit(submission("Girona", "17002")).await.unwrap();

    assert_eq!(first.lead.provider_ids, vec![a.id]);
    assert_eq!(second.lead.provider_ids, vec![b.id]);
}

#[tokio::test]
async fn daily_cap_excludes_full_providers() {
    let (_dir, repos) = temp_repositories();
    let capped = repos
        .providers
        .create(ProviderInput {
            daily_cap: Some(1),
            ..provider_input("Tope Uno", &[], &[], 1)
        })
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let first = orch.submit(submission("Murcia", "30001")).await.unwrap();
    let second = orch.submit(submission("Murcia", "30002")).await.unwrap();

    assert_eq!(first.lead.provider_ids, vec![capped.id]);
    assert!(second.lead.provider_ids.is_empty());
    assert_eq!(second.lead.status, LeadStatus::Validated);
}

#[tokio::test]
async fn verified_referral_gets_commission_estimate() {
    let (_dir, repos) = temp_repositories();
    let collaborator = repos
        .collaborators
        .create(CollaboratorInput {
            name: Some("Gestoría Puig".to_string()),
            tracking_code: Some("puig10".to_string()),
            commission_type: Some("percent".to_string()),
            commission_value: Some(10.0),
            ..CollaboratorInput::default()
        })
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);

    let mut verified = submission("Tarragona", "43001");
    verified.input.tracking_code = Some("PUIG10".to_string());
    verified.phone_verified = true;
    let lead = orch.submit(verified).await.unwrap().lead;
    assert_eq!(lead.collaborator_id.as_deref(), Some(collaborator.id.as_str()));
    assert_eq!(
        lead.commission_estimated_eur,
        Some(collaborator.estimate_commission(lead.ticket_estimated_eur))
    );
    assert_eq!(lead.commission_estimated_eur, Some(90));

    let mut unverified = submission("Tarragona", "43002");
    unverified.input.tracking_code = Some("puig10".to_string());
    let lead = orch.submit(unverified).await.unwrap().lead;
    assert_eq!(lead.collaborator_id.as_deref(), Some(collaborator.id.as_str()));
    assert_eq!(lead.commission_estimated_eur, None);
}

#[tokio::test]
async fn paused_collaborator_is_not_attached() {
    let (_dir, repos) = temp_repositories();
    repos
        .collaborators
        .create(CollaboratorInput {
            name: Some("Inmobiliaria Mar".to_string()),
            tracking_code: Some("MAR".to_string()),
            status: Some("paused".to_string()),
            ..CollaboratorInput::default()
        })
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let mut input = submission("Alicante", "03001");
    input.input.tracking_code = Some("MAR".to_string());
    let lead = orchestrator(&repos, &notifier, 2).submit(input).await.unwrap().lead;
    assert!(lead.collaborator_id.is_none());
    assert!(lead.collaborator_tracking_code.is_none());
}

#[tokio::test]
async fn manual_assignment_validates_provider_ids() {
    let (_dir, repos) = temp_repositories();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Lleida", "25001")).await.unwrap().lead;

    let a = repos
        .providers
        .create(provider_input("Uno", &[], &[], 1))
        .await
        .unwrap();
    let b = repos
        .providers
        .create(provider_input("Dos", &[], &[], 1))
        .await
        .unwrap();
    let c = repos
        .providers
        .create(provider_input("Tres", &[], &[], 1))
        .await
        .unwrap();

    let err = orch
        .assign_manual(&lead.id, vec![], None, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let err = orch
        .assign_manual(&lead.id, vec![a.id.clone(), b.id.clone(), c.id.clone()], None, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let err = orch
        .assign_manual(&lead.id, vec![a.id.clone(), "nope".to_string()], None, &admin())
        .await
        .unwrap_err();
    match err {
        PipelineError::UnknownProviders(missing) => assert_eq!(missing, vec!["nope".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn manual_assignment_warns_about_inactive_providers() {
    let (_dir, repos) = temp_repositories();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Huesca", "22001")).await.unwrap().lead;
    assert_eq!(lead.status, LeadStatus::Validated);

    let active = repos
        .providers
        .create(provider_input("Activo", &[], &[], 1))
        .await
        .unwrap();
    let inactive = repos
        .providers
        .create(ProviderInput {
            active: Some(false),
            ..provider_input("Dormido", &[], &[], 1)
        })
        .await
        .unwrap();

    let outcome = orch
        .assign_manual(
            &lead.id,
            vec![active.id.clone(), inactive.id.clone(), active.id.clone()],
            Some("llamar por la tarde".to_string()),
            &admin(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.lead.provider_ids, vec![active.id.clone(), inactive.id.clone()]);
    assert_eq!(outcome.lead.assigned_provider_id.as_deref(), Some(active.id.as_str()));
    assert_eq!(outcome.lead.status, LeadStatus::Assigned);
    assert_eq!(outcome.lead.assignment_mode, AssignmentMode::Manual);
    assert_eq!(outcome.lead.assigned_by.as_deref(), Some("admin"));
    assert!(outcome.lead.notes.contains("[ADMIN manual assign"));
    assert!(outcome.lead.notes.ends_with("llamar por la tarde"));
    assert_eq!(outcome.warnings, vec![format!("inactive_providers: {}", inactive.id)]);
    assert_eq!(notifier.provider_emails(), vec![active.id, inactive.id]);
    assert!(event_names(&repos).await.contains(&events::LEAD_ASSIGNED_MANUAL.to_string()));
}

#[tokio::test]
async fn reassignment_is_refused_for_closed_leads() {
    let (_dir, repos) = temp_repositories();
    let provider = repos
        .providers
        .create(provider_input("Cerrado", &[], &[], 1))
        .await
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Soria", "42001")).await.unwrap().lead;

    orch.update_lead(&lead.id, Some(LeadStatus::Accepted), None)
        .await
        .unwrap();

    let err = orch.reassign_auto(&lead.id, &admin()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotAllowed { status: LeadStatus::Accepted, .. }));

    let err = orch
        .assign_manual(&lead.id, vec![provider.id], None, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAllowed { .. }));
}

#[tokio::test]
async fn reassign_auto_keeps_sent_status_and_clears_when_empty() {
    let (_dir, repos) = temp_repositories();
    let provider = repos
        .providers
        .create(provider_input("Único", &[], &[], 1))
        .await
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Cuenca", "16001")).await.unwrap().lead;
    assert_eq!(lead.status, LeadStatus::Sent);

    let outcome = orch.reassign_auto(&lead.id, &admin()).await.unwrap();
    assert_eq!(outcome.lead.status, LeadStatus::Sent);
    assert_eq!(outcome.lead.provider_ids, vec![provider.id.clone()]);
    assert_eq!(outcome.lead.assigned_by.as_deref(), Some("admin"));

    repos
        .providers
        .update(
            &provider.id,
            ProviderInput {
                active: Some(false),
                ..ProviderInput::default()
            },
        )
        .await
        .unwrap();
    orch.update_lead(&lead.id, Some(LeadStatus::Assigned), None)
        .await
        .unwrap();

    let outcome = orch.reassign_auto(&lead.id, &admin()).await.unwrap();
    assert!(outcome.assigned_providers.is_empty());
    assert!(outcome.lead.provider_ids.is_empty());
    assert!(outcome.lead.assigned_provider_id.is_none());
    assert_eq!(outcome.lead.status, LeadStatus::Validated);
}

#[tokio::test]
async fn reassign_auto_emails_only_the_primary_provider() {
    let (_dir, repos) = temp_repositories();
    for (name, priority) in [("Primera Seguridad", 1), ("Segunda Seguridad", 2)] {
        repos
            .providers
            .create(provider_input(name, &[], &[], priority))
            .await
            .unwrap();
    }
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Teruel", "44001")).await.unwrap().lead;
    assert_eq!(notifier.provider_emails().len(), 2);

    let outcome = orch.reassign_auto(&lead.id, &admin()).await.unwrap();

    assert_eq!(outcome.assigned_providers.len(), 2);
    let emails = notifier.provider_emails();
    assert_eq!(emails.len(), 3);
    assert_eq!(Some(&emails[2]), outcome.lead.assigned_provider_id.as_ref());
}

#[tokio::test]
async fn collaborator_change_is_locked_once_closed() {
    let (_dir, repos) = temp_repositories();
    repos
        .collaborators
        .create(CollaboratorInput {
            name: Some("Partner".to_string()),
            tracking_code: Some("FIX50".to_string()),
            commission_type: Some("fixed".to_string()),
            commission_value: Some(50.0),
            ..CollaboratorInput::default()
        })
        .await
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);

    let validated = orch.submit(submission("Teruel", "44001")).await.unwrap().lead;
    let updated = orch
        .set_collaborator(&validated.id, Some("fix50"), &admin())
        .await
        .unwrap();
    assert_eq!(updated.collaborator_tracking_code.as_deref(), Some("FIX50"));
    assert_eq!(updated.commission_estimated_eur, Some(50));

    let cleared = orch.set_collaborator(&validated.id, None, &admin()).await.unwrap();
    assert!(cleared.collaborator_id.is_none());
    assert!(cleared.commission_estimated_eur.is_none());

    let err = orch
        .set_collaborator(&validated.id, Some("UNKNOWN"), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CollaboratorNotFound(_)));

    repos
        .providers
        .create(provider_input("Envía", &[], &[], 1))
        .await
        .unwrap();
    let sent = orch.submit(submission("Teruel", "44002")).await.unwrap().lead;
    assert_eq!(sent.status, LeadStatus::Sent);
    let credited = orch
        .set_collaborator(&sent.id, Some("FIX50"), &admin())
        .await
        .unwrap();
    assert_eq!(credited.commission_estimated_eur, Some(50));

    orch.update_lead(&sent.id, Some(LeadStatus::Sold), None)
        .await
        .unwrap();
    let err = orch
        .set_collaborator(&sent.id, None, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAllowed { status: LeadStatus::Sold, .. }));
}

#[tokio::test]
async fn anonymize_scrubs_personal_data() {
    let (_dir, repos) = temp_repositories();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    let lead = orch.submit(submission("Zamora", "49001")).await.unwrap().lead;

    let scrubbed = orch
        .anonymize(&lead.id, Some("solicitud RGPD"), &admin())
        .await
        .unwrap();
    assert_eq!(scrubbed.status, LeadStatus::Deleted);
    assert_eq!(scrubbed.name, "ANONIMIZADO");
    assert!(scrubbed.email.is_empty());
    assert!(scrubbed.phone.is_empty());
    assert!(scrubbed.city.is_empty());
    assert!(scrubbed.postal_code.is_empty());
    assert!(scrubbed.consent_ip.is_none());
    assert!(scrubbed.deleted_at.is_some());
    assert!(scrubbed.notes.ends_with("[ANONYMIZED] solicitud RGPD"));

    let event = repos
        .events
        .list(10)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.event_name == events::LEAD_ANONYMIZED)
        .unwrap();
    assert_eq!(event.payload["reason"], "solicitud RGPD");
    assert_eq!(event.context["actor"], "admin");

    let err = orch.anonymize("missing", None, &admin()).await.unwrap_err();
    assert!(matches!(err, PipelineError::LeadNotFound(_)));
}

#[tokio::test]
async fn provider_in_use_cannot_be_deleted() {
    let (_dir, repos) = temp_repositories();
    let used = repos
        .providers
        .create(provider_input("Usado", &["ourense"], &[], 1))
        .await
        .unwrap();
    let spare = repos
        .providers
        .create(provider_input("Libre", &["lugo"], &[], 1))
        .await
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    orch.submit(submission("Ourense", "32001")).await.unwrap();

    let err = orch.delete_provider(&used.id, &admin()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ProviderInUse(_)));

    let deleted = orch.delete_provider(&spare.id, &admin()).await.unwrap();
    assert_eq!(deleted.id, spare.id);
    assert!(repos.providers.get_by_id(&spare.id).await.unwrap().is_none());

    let err = orch.delete_provider(&spare.id, &admin()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ProviderNotFound(_)));
}

#[tokio::test]
async fn metrics_count_leads_and_events() {
    let (_dir, repos) = temp_repositories();
    repos
        .providers
        .create(provider_input("Métrica", &["palencia"], &[], 1))
        .await
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);
    orch.submit(submission("Palencia", "34001")).await.unwrap();
    orch.submit(submission("Burgos", "09001")).await.unwrap();

    let metrics = orch.metrics().await.unwrap();
    assert_eq!(metrics.totals.leads, 2);
    assert_eq!(metrics.totals.providers, 1);
    assert_eq!(metrics.totals.events, 6);
    assert_eq!(metrics.leads_by_status.get("sent"), Some(&1));
    assert_eq!(metrics.leads_by_status.get("validated"), Some(&1));
    assert_eq!(metrics.events_by_name.get(events::LEAD_SUBMITTED), Some(&2));
}

#[tokio::test]
async fn metrics_cover_the_whole_event_log() {
    let (dir, repos) = temp_repositories();
    let now = chrono::Utc::now();
    let seeded: Vec<LeadEvent> = (0..1500)
        .map(|i| LeadEvent {
            id: format!("evt-{i}"),
            event_name: if i % 3 == 0 {
                events::LEAD_SENT.to_string()
            } else {
                events::LEAD_SUBMITTED.to_string()
            },
            timestamp: now - chrono::Duration::seconds(i),
            payload: serde_json::json!({ "lead_id": format!("lead-{i}") }),
            context: serde_json::Value::Null,
        })
        .collect();
    std::fs::write(
        dir.path().join("events.json"),
        serde_json::to_string(&seeded).unwrap(),
    )
    .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);

    let metrics = orch.metrics().await.unwrap();

    assert_eq!(metrics.totals.events, 1500);
    assert_eq!(metrics.events_by_name.get(events::LEAD_SENT), Some(&500));
    assert_eq!(metrics.events_by_name.get(events::LEAD_SUBMITTED), Some(&1000));
}

#[tokio::test]
async fn event_log_failures_do_not_stop_submission() {
    let (_dir, repos) = temp_repositories();
    let provider = repos
        .providers
        .create(provider_input("Alarmas Eventos", &[], &[], 1))
        .await
        .unwrap();
    let repos = Repositories {
        events: Arc::new(BrokenEvents),
        ..repos
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);

    let outcome = orch.submit(submission("Huesca", "22001")).await.unwrap();

    assert_eq!(outcome.lead.status, LeadStatus::Sent);
    assert_eq!(notifier.provider_emails(), vec![provider.id.clone()]);
    assert_eq!(notifier.confirmations(), 1);
    let stored = repos.leads.get_by_id(&outcome.lead.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LeadStatus::Sent);
}

#[tokio::test]
async fn lead_write_failure_aborts_before_any_email() {
    let (_dir, repos) = temp_repositories();
    repos
        .providers
        .create(provider_input("Alarmas Caídas", &[], &[], 1))
        .await
        .unwrap();
    let repos = Repositories {
        leads: Arc::new(FailingLeadUpdates {
            inner: repos.leads.clone(),
        }),
        ..repos
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let orch = orchestrator(&repos, &notifier, 2);

    let err = orch.submit(submission("Soria", "42001")).await.unwrap_err();

    assert!(matches!(err, PipelineError::Repository(_)));
    assert!(notifier.sent().is_empty());
    // The created lead stays behind in its first state
    let leads = repos.leads.list().await.unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].status, LeadStatus::New);
    assert!(leads[0].provider_ids.is_empty());
}
