//! Seeds demo providers (upsert by email) and, unless `SEED_SKIP_LEAD=true`,
//! pushes one demo lead through the full pipeline.

use punto_seguro_api::config::Config;
use punto_seguro_api::models::{LeadInput, ProviderInput, StringList};
use punto_seguro_api::notifications::LeadNotifier;
use punto_seguro_api::orchestrator::{LeadOrchestrator, LeadSubmission};
use serde_json::json;
use std::sync::Arc;

struct DemoProvider {
    name: &'static str,
    email: &'static str,
    phone: &'static str,
    zones: &'static [&'static str],
    business_types: &'static [&'static str],
    priority: i32,
    daily_cap: i32,
}

const DEMO_PROVIDERS: &[DemoProvider] = &[
    DemoProvider {
        name: "Alarma BCN Centro",
        email: "demo-bcn-centro@puntoseguro.local",
        phone: "+34 931 000 001",
        zones: &["08001", "08002", "08003", "barcelona"],
        business_types: &["vivienda", "comercio"],
        priority: 10,
        daily_cap: 4,
    },
    DemoProvider {
        name: "Castelldefels Protegido",
        email: "demo-castelldefels@puntoseguro.local",
        phone: "+34 936 000 002",
        zones: &["08860", "castelldefels"],
        business_types: &["vivienda"],
        priority: 20,
        daily_cap: 3,
    },
    DemoProvider {
        name: "Gavà Seguridad Activa",
        email: "demo-gava@puntoseguro.local",
        phone: "+34 936 000 003",
        zones: &["08850", "gava"],
        business_types: &["vivienda", "comercio"],
        priority: 15,
        daily_cap: 3,
    },
    DemoProvider {
        name: "Viladecans Alerta",
        email: "demo-viladecans@puntoseguro.local",
        phone: "+34 936 000 004",
        zones: &["08840", "viladecans"],
        business_types: &["vivienda", "comercio"],
        priority: 25,
        daily_cap: 2,
    },
    DemoProvider {
        name: "Barcelona Empresas Seguras",
        email: "demo-bcn-empresa@puntoseguro.local",
        phone: "+34 931 000 005",
        zones: &["08001", "08002", "08003", "08004", "barcelona"],
        business_types: &["comercio", "oficina"],
        priority: 30,
        daily_cap: 5,
    },
];

impl DemoProvider {
    fn input(&self) -> ProviderInput {
        ProviderInput {
            name: Some(self.name.to_string()),
            email: Some(self.email.to_string()),
            phone: Some(self.phone.to_string()),
            zones: Some(StringList::from(self.zones.to_vec())),
            business_types: Some(StringList::from(self.business_types.to_vec())),
            active: Some(true),
            priority: Some(self.priority),
            daily_cap: Some(self.daily_cap),
            ..ProviderInput::default()
        }
    }
}

fn demo_lead() -> LeadInput {
    LeadInput {
        name: Some("Lead Demo Punto Seguro".to_string()),
        email: Some("lead-demo@puntoseguro.local".to_string()),
        phone: Some("+34 600 111 222".to_string()),
        city: Some("Barcelona".to_string()),
        postal_code: Some("08002".to_string()),
        business_type: Some("vivienda".to_string()),
        risk_level: Some("alto".to_string()),
        urgency: Some("alta".to_string()),
        budget_range: Some("1500_3000".to_string()),
        consent: true,
        evaluation_summary: Some(json!(
            "Accesos principales y horarios previsibles incrementan la exposición."
        )),
        ..LeadInput::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    punto_seguro_api::obs::init_tracing();
    let config = Config::from_env()?;
    let repos = punto_seguro_api::data::open_repositories(&config).await?;

    let existing = repos.providers.list().await?;
    for demo in DEMO_PROVIDERS {
        match existing.iter().find(|p| p.email == demo.email) {
            Some(found) => {
                repos.providers.update(&found.id, demo.input()).await?;
                tracing::info!("Updated provider {}", demo.name);
            }
            None => {
                repos.providers.create(demo.input()).await?;
                tracing::info!("Created provider {}", demo.name);
            }
        }
    }
    let total = repos.providers.list().await?.len();

    let notifier = Arc::new(punto_seguro_api::integrations::build_notifier(&config)?);
    let email_mode = notifier.mode();
    let skip_lead = std::env::var("SEED_SKIP_LEAD").is_ok_and(|v| v.trim() == "true");

    println!("Seed completado");
    println!("Providers totales: {}", total);
    if skip_lead {
        println!("Lead demo omitido (SEED_SKIP_LEAD=true)");
    } else {
        let orchestrator =
            LeadOrchestrator::new(repos.clone(), notifier, config.max_providers_per_lead);
        let outcome = orchestrator
            .submit(LeadSubmission {
                input: demo_lead(),
                requester_ip: Some("127.0.0.1".to_string()),
                phone_verified: false,
            })
            .await?;
        println!("Lead demo creado: {}", outcome.lead.id);
        println!(
            "Providers asignados al demo: {}",
            outcome.assigned_providers.len()
        );
    }
    println!("Modo email: {}", email_mode);

    Ok(())
}
