//! Command-line surface for the engine.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "geotrigger", version, about = "Rule execution orchestration for geofence-triggered contract calls")]
pub struct Cli {
    /// Base URL of the rule persistence API.
    #[arg(long, env = "GEOTRIGGER_API_URL")]
    pub api_url: String,

    /// Base URL of the execution service.
    #[arg(long, env = "GEOTRIGGER_EXECUTOR_URL")]
    pub executor_url: String,

    /// Base URL of the credential (passkey) service.
    #[arg(long, env = "GEOTRIGGER_CREDENTIALS_URL")]
    pub credentials_url: String,

    /// Path to the local lifecycle database.
    #[arg(long, env = "GEOTRIGGER_DB", default_value = "geotrigger.db")]
    pub db: PathBuf,

    /// Acting identity (source account / smart-wallet owner).
    #[arg(long, env = "GEOTRIGGER_IDENTITY")]
    pub identity: String,

    /// Secret key for write functions. Prefer the env var over the flag.
    #[arg(long, env = "GEOTRIGGER_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct EventKeyArgs {
    /// Rule id of the match event.
    #[arg(long)]
    pub rule: i64,

    /// Matched wallet public key.
    #[arg(long)]
    pub wallet: String,

    /// Location-update id that caused the match, when known.
    #[arg(long)]
    pub update: Option<i64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List pending match events.
    Pending,

    /// List completed executions (deduplicated view).
    Completed,

    /// List rejected match events.
    Rejected,

    /// Execute one pending match event.
    Execute(EventKeyArgs),

    /// Execute several pending match events as one batch
    /// (authorization up front, then sequential submission).
    Batch {
        /// Keys as rule:wallet[:update], repeatable.
        #[arg(long = "event", required = true)]
        events: Vec<String>,
    },

    /// Reject a pending match event. Irreversible.
    Reject(EventKeyArgs),

    /// Check a rule's quorum status against wallets currently in range.
    Quorum {
        #[arg(long)]
        rule: i64,

        /// Wallets currently in range, repeatable.
        #[arg(long = "in-range")]
        in_range: Vec<String>,
    },

    /// Retry completion bookkeeping for transactions that already landed
    /// on-chain.
    Reconcile,

    /// List configured rules.
    Rules,
}

/// Parse `rule:wallet[:update]` into an event key triple.
pub fn parse_event_key(raw: &str) -> anyhow::Result<(i64, String, Option<i64>)> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [rule, wallet] => Ok((rule.parse()?, wallet.to_string(), None)),
        [rule, wallet, update] => Ok((rule.parse()?, wallet.to_string(), Some(update.parse()?))),
        _ => anyhow::bail!("expected rule:wallet[:update], got '{}'", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_parsing() {
        assert_eq!(
            parse_event_key("5:W1:42").unwrap(),
            (5, "W1".to_string(), Some(42))
        );
        assert_eq!(parse_event_key("5:W1").unwrap(), (5, "W1".to_string(), None));
        assert!(parse_event_key("W1").is_err());
        assert!(parse_event_key("x:W1").is_err());
    }
}
