use std::env;

use anyhow::{bail, Context, Result};
use serde_json::json;
use uuid::Uuid;

use docforge::{
    config::AppConfig,
    jobs::{CleanupKind, CleanupPayload},
    models::{NewTemplate, NewTenant, NewUser},
    state::{build_state, AppState},
    workers::run_cleanup,
};

const USAGE: &str = "Usage:
  maintenance seed <tenant-name> <portal-id> <admin-email>
  maintenance issue-token <user-id>
  maintenance cleanup <type> [--dry-run] [--hours N] [--tenant ID]";

const SAMPLE_TEMPLATE: &str = "<html><body>\
<h1>Quote for {{contact.firstname}} {{contact.lastname}}</h1>\
<p>Deal: {{deal.dealname}} ({{deal.amount}})</p>\
<p>Prepared on {{custom.prepared_on}}</p>\
</body></html>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded docforge configuration"
    );

    match command.as_str() {
        "seed" => {
            let [tenant, portal, email] = &args[1..] else {
                bail!("seed expects <tenant-name> <portal-id> <admin-email>\n{USAGE}");
            };
            let state = build_state(config, 1).await?;
            seed(&state, tenant, portal, email).await?
        }
        "issue-token" => {
            let user_id: Uuid = args
                .get(1)
                .context("issue-token expects <user-id>")?
                .parse()
                .context("user id must be a UUID")?;
            let state = build_state(config, 1).await?;
            issue_token(&state, user_id).await?
        }
        "cleanup" => {
            let payload = parse_cleanup(&args[1..])?;
            let state = build_state(config, 2).await?;
            if payload.kind == CleanupKind::CompletedJobs {
                state.queue.initialize().await?;
            }
            let report = run_cleanup(&state, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn seed(state: &AppState, tenant_name: &str, portal_id: &str, email: &str) -> Result<()> {
    let tenant = state
        .repo
        .create_tenant(NewTenant {
            id: Uuid::new_v4(),
            name: tenant_name.to_string(),
            portal_id: portal_id.to_string(),
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
        })
        .await?;
    let user = state
        .repo
        .create_user(NewUser {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            email: email.to_string(),
            name: None,
            role: "admin".to_string(),
        })
        .await?;
    let template = state
        .repo
        .create_template(NewTemplate {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            created_by: Some(user.id),
            name: "Sample quote".to_string(),
            description: Some("Seeded example template".to_string()),
            content: SAMPLE_TEMPLATE.to_string(),
            variables: json!([
                {"name": "contact.firstname", "type": "contact.property", "required": true},
                {"name": "contact.lastname", "type": "contact.property"},
                {"name": "deal.dealname", "type": "deal.property"},
                {"name": "deal.amount", "type": "deal.property"},
                {"name": "custom.prepared_on", "type": "custom"}
            ]),
            is_active: true,
        })
        .await?;

    println!("tenant   {}", tenant.id);
    println!("user     {}", user.id);
    println!("template {}", template.id);
    println!("token    {}", state.jwt.generate_token(&user)?);
    Ok(())
}

async fn issue_token(state: &AppState, user_id: Uuid) -> Result<()> {
    let user = state
        .repo
        .get_user(user_id)
        .await?
        .with_context(|| format!("user {user_id} not found"))?;
    println!("{}", state.jwt.generate_token(&user)?);
    Ok(())
}

fn parse_cleanup(args: &[String]) -> Result<CleanupPayload> {
    let mut args = args.iter();
    let kind: CleanupKind = args
        .next()
        .context("cleanup expects a type")?
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let mut payload = CleanupPayload::new(kind);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dry-run" => payload.dry_run = true,
            "--hours" => {
                let hours = args.next().context("--hours expects a value")?;
                payload.older_than_hours = Some(hours.parse().context("--hours must be a number")?);
            }
            "--tenant" => {
                let tenant = args.next().context("--tenant expects a value")?;
                payload.tenant_id = Some(tenant.parse().context("--tenant must be a UUID")?);
            }
            other => bail!("unknown cleanup option {other}\n{USAGE}"),
        }
    }
    Ok(payload)
}
