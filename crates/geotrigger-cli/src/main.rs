mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{parse_event_key, Cli, Command};
use geotrigger_core::executor::ExecCredentials;
use geotrigger_core::model::EventKey;
use geotrigger_core::services::http::{HttpCredentialService, HttpExecutionService, HttpRuleApi};
use geotrigger_core::services::{RuleApi, SecretKey};
use geotrigger_core::{Engine, LifecycleStore};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geotrigger=info".into()),
        )
        .init();

    let args = Cli::parse();

    let store = LifecycleStore::open(&args.db)
        .with_context(|| format!("failed to open lifecycle db at {}", args.db.display()))?;
    let rules = Arc::new(HttpRuleApi::new(args.api_url.clone()));
    let mut engine = Engine::new(
        store,
        rules.clone(),
        Arc::new(HttpExecutionService::new(args.executor_url.clone(), None)),
        Arc::new(HttpCredentialService::new(args.credentials_url.clone())),
    );

    let secret_key = match &args.secret_key {
        Some(raw) => Some(
            SecretKey::parse(raw).context("secret key is not a valid 56-character seed")?,
        ),
        None => None,
    };
    let creds = ExecCredentials {
        identity: args.identity.clone(),
        secret_key,
    };

    match args.command {
        Command::Pending => {
            for event in engine.refresh_pending().await? {
                println!(
                    "{}  matched {}  {}",
                    event.key(),
                    event.matched_at.to_rfc3339(),
                    event.message
                );
            }
        }
        Command::Completed => {
            for record in engine.list_completed()? {
                println!(
                    "{}  completed {}",
                    record.dedup_key(),
                    record.completed_at.to_rfc3339()
                );
            }
        }
        Command::Rejected => {
            for event in engine.list_rejected()? {
                println!("{}  {}", event.key(), event.message);
            }
        }
        Command::Execute(key) => {
            engine.refresh_pending().await?;
            let key = EventKey::new(key.rule, key.wallet, key.update);
            let outcome = engine.execute(&key, &creds).await?;
            match outcome.transaction_hash {
                Some(tx) => println!("executed {} (tx {})", key, tx),
                None => println!("executed {} (simulated)", key),
            }
        }
        Command::Batch { events } => {
            engine.refresh_pending().await?;
            for raw in &events {
                let (rule, wallet, update) = parse_event_key(raw)?;
                engine.select(EventKey::new(rule, wallet, update));
            }
            let report = engine.execute_selected(&creds).await;
            println!("{}", report.summary());
            for item in &report.per_item {
                match &item.result {
                    Ok(outcome) => println!(
                        "  {}  ok{}",
                        item.key,
                        outcome
                            .transaction_hash
                            .as_deref()
                            .map(|tx| format!(" (tx {})", tx))
                            .unwrap_or_default()
                    ),
                    Err(e) => println!("  {}  failed: {}", item.key, e),
                }
            }
        }
        Command::Reject(key) => {
            let key = EventKey::new(key.rule, key.wallet, key.update);
            if engine.reject(&key)? {
                println!("rejected {}", key);
            } else {
                println!("no pending event for {}", key);
            }
        }
        Command::Quorum { rule, in_range } => {
            let wallets: BTreeSet<String> = in_range.into_iter().collect();
            let status = engine.check_quorum(rule, &wallets).await?;
            println!(
                "quorum {}: in range {:?}, out of range {:?}",
                if status.met { "met" } else { "not met" },
                status.in_range,
                status.out_of_range
            );
        }
        Command::Reconcile => {
            let drained = engine.reconcile().await?;
            println!("reconciled {} completion(s)", drained);
        }
        Command::Rules => {
            for rule in rules.list_rules().await? {
                println!(
                    "#{}  {}::{}  trigger={:?}  active={}",
                    rule.id,
                    rule.contract_id,
                    rule.function_name,
                    rule.trigger_on,
                    rule.is_active
                );
            }
        }
    }

    Ok(())
}
