use anyhow::{Context, bail};
use botrunner::{
    config::{ConfigManager, EnvConfigManager, Settings},
    logger::init_tracing,
    model::TenantConfig,
    platform::{ChatPlatform, mock::MockPlatform, telegram::TelegramPlatform},
    store::split_path,
    supervisor::Supervisor,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "botrunner",
    about = "Keeps a fleet of tenant chat bots in sync with a live configuration tree",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor (default)
    Run(RunArgs),

    /// Check a bots document without starting anything
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// `.env` file to load before reading settings
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log filter override (e.g. error, warn, info, debug, botrunner=trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Open in-memory sessions instead of connecting to Telegram
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// JSON document shaped like `{ "bots": { ... } }`
    file: PathBuf,

    /// Path of the bots object inside the document
    #[arg(long, default_value = "bots")]
    root: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Validate(args) => {
            if !validate_file(&args.file, &args.root)? {
                process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let env = EnvConfigManager::new(args.env_file.clone());
    let env_status = env.status().clone();
    let config_mgr = ConfigManager(env);
    let mut settings = Settings::load(&config_mgr).await?;
    if let Some(level) = args.log_level {
        settings.log.log_level = level;
    }
    if args.log_dir.is_some() {
        settings.log.log_dir = args.log_dir;
    }
    if args.otel_endpoint.is_some() {
        settings.log.otel_endpoint = args.otel_endpoint;
    }

    let telemetry = init_tracing(&settings.log)?;
    env_status.log();
    info!(?config_mgr, source = ?settings.source, root = %settings.bots_root, "botrunner starting up…");

    let platform: Arc<dyn ChatPlatform> = if args.dry_run {
        info!("dry run: sessions stay in memory");
        Arc::new(MockPlatform::new())
    } else {
        Arc::new(TelegramPlatform::new())
    };

    println!("botrunner running; press Ctrl-C to exit");
    let result = Supervisor::new(settings, platform).run().await;
    if let Err(e) = &result {
        error!("botrunner failed: {e:#}");
    }
    telemetry.shutdown();
    result
}

/// Print one line per tenant. `Ok(false)` if any tenant would be stopped as
/// malformed.
fn validate_file(file: &Path, root: &str) -> anyhow::Result<bool> {
    let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let doc: Value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let null = Value::Null;
    let mut node = &doc;
    for segment in split_path(root) {
        node = node.get(segment.as_str()).unwrap_or(&null);
    }
    let tenants = match node {
        Value::Object(map) => map,
        Value::Null => {
            println!("no bots under `{root}`");
            return Ok(true);
        }
        _ => bail!("`{root}` must be an object"),
    };

    let mut valid = true;
    for (tenant_id, value) in tenants {
        match TenantConfig::from_node(tenant_id, Some(value)) {
            Ok(Some(cfg)) => {
                let enabled = cfg.chats.values().filter(|c| c.active).count();
                println!(
                    "✅ {tenant_id}: {}, {} chats ({enabled} enabled)",
                    if cfg.active { "active" } else { "inactive" },
                    cfg.chats.len()
                );
            }
            Ok(None) => println!("✅ {tenant_id}: empty"),
            Err(e) => {
                valid = false;
                println!("❌ {e}");
            }
        }
    }
    Ok(valid)
}
