use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use windowguard::config::{LoggingConfig, WindowguardConfig};
use windowguard::metrics::TracingMetrics;
use windowguard::ratelimit::{
    RateLimitedEntity, RateLimitedSubject, RateLimitedUser, RateLimiter, RedisBackend, RuleTable,
    DEFAULT_USER_DOMAIN,
};
use windowguard::WindowguardError;

/// Inspect and administer rate limits stored in Redis.
#[derive(Parser, Debug)]
#[command(name = "windowguard", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the limits and record a call if allowed
    Check(EntityArgs),
    /// Show the remaining quota without recording anything
    Quota(EntityArgs),
    /// Deny every call for a number of seconds
    Block {
        #[command(flatten)]
        entity: EntityArgs,
        /// Block duration in seconds
        #[arg(long)]
        seconds: u64,
    },
    /// Lift a block
    Unblock(EntityArgs),
    /// Forget call history and any block
    Clear(EntityArgs),
    /// Print the configured rule table
    Rules,
}

#[derive(Args, Debug)]
struct EntityArgs {
    /// Limit a user by id
    #[arg(long, conflicts_with = "subject", required_unless_present = "subject")]
    user: Option<u64>,

    /// Limit another subject, given as KIND:ID
    #[arg(long)]
    subject: Option<String>,

    /// Rate limit domain
    #[arg(long, default_value = DEFAULT_USER_DOMAIN)]
    domain: String,

    /// The user's custom rules, e.g. "1:5,60:100"
    #[arg(long, requires = "user")]
    custom_rules: Option<String>,
}

impl EntityArgs {
    fn entity(&self, table: Arc<RuleTable>) -> anyhow::Result<Box<dyn RateLimitedEntity>> {
        if let Some(user_id) = self.user {
            let user = RateLimitedUser::with_domain(user_id, self.domain.clone(), table)
                .with_custom_rules(self.custom_rules.clone().unwrap_or_default());
            return Ok(Box::new(user));
        }

        let subject = self.subject.as_deref().unwrap_or_default();
        let (kind, id) = subject
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("--subject must look like KIND:ID, got {:?}", subject))?;
        Ok(Box::new(RateLimitedSubject::new(
            kind,
            id,
            self.domain.clone(),
            table,
        )))
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = WindowguardConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    info!(redis = %config.redis.url, prefix = %config.redis.key_prefix, "Configuration loaded");

    let table = Arc::new(config.rule_table()?);

    // Opening the client only parses the URL; nothing connects until a command runs.
    let backend = RedisBackend::from_config(&config.redis)?;
    let limiter = RateLimiter::new(Arc::new(backend)).with_metrics(Arc::new(TracingMetrics));

    let output = match &cli.command {
        Command::Check(args) => {
            let entity = args.entity(table)?;
            match limiter.enforce(entity.as_ref()).await {
                Ok(verdict) => json!({ "key": entity.key(), "verdict": verdict }),
                Err(err @ WindowguardError::RateLimited { wait_seconds }) => json!({
                    "key": entity.key(),
                    "verdict": { "denied": true, "wait_seconds": wait_seconds, "remaining": 0 },
                    "retry_after": err.retry_after_secs(),
                }),
                Err(err) => return Err(err.into()),
            }
        }
        Command::Quota(args) => {
            let entity = args.entity(table)?;
            let quota = limiter.quota_left(entity.as_ref()).await?;
            json!({ "key": entity.key(), "quota": quota })
        }
        Command::Block { entity, seconds } => {
            let entity = entity.entity(table)?;
            limiter.block(entity.as_ref(), *seconds).await?;
            json!({ "key": entity.key(), "blocked_for": seconds })
        }
        Command::Unblock(args) => {
            let entity = args.entity(table)?;
            limiter.unblock(entity.as_ref()).await?;
            json!({ "key": entity.key(), "unblocked": true })
        }
        Command::Clear(args) => {
            let entity = args.entity(table)?;
            limiter.clear_history(entity.as_ref()).await?;
            json!({ "key": entity.key(), "cleared": true })
        }
        Command::Rules => serde_json::to_value(table.snapshot())?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
