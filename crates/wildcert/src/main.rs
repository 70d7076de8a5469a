use anyhow::{Context, bail};
use chrono::Utc;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use wc_acme::{Database, EngineConfig, ProvisioningEngine, TokioCommandRunner, ZoneResolver};
use wc_common::config::EnvConfig;

const USAGE: &str = "usage: wildcert [run | queue <host> | status | backfill]";

enum Command {
    Run,
    Queue(String),
    Status,
    Backfill,
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let command = match args.next().as_deref() {
            None | Some("run") => Self::Run,
            Some("queue") => match args.next() {
                Some(host) => Self::Queue(host),
                None => bail!("queue needs a host\n{}", USAGE),
            },
            Some("status") => Self::Status,
            Some("backfill") => Self::Backfill,
            Some("-h" | "--help" | "help") => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            Some(other) => bail!("unknown command '{}'\n{}", other, USAGE),
        };
        if let Some(extra) = args.next() {
            bail!("unexpected argument '{}'\n{}", extra, USAGE);
        }
        Ok(command)
    }
}

// Environment is loaded before any runtime thread exists
fn main() -> anyhow::Result<()> {
    let env = EnvConfig::load(None);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wildcert=debug,wc_acme=debug")),
        )
        .init();

    let command = Command::parse(std::env::args().skip(1))?;
    env.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(env, command))
}

async fn run(env: EnvConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => print_status(&env)?,
        Command::Run => {
            let engine = build_engine(&env)?;
            info!(
                provider = %engine.provider(),
                cert_dir = %env.cert_dir.display(),
                "Wildcard certificate maintenance starting"
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let mut signals =
                Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
            let signals_handle = signals.handle();
            tokio::spawn(async move {
                if let Some(signal) = signals.next().await {
                    warn!(signal, "Shutdown requested, finishing the current zone");
                    let _ = shutdown_tx.send(true);
                }
            });

            let report = engine.run_until(Utc::now(), shutdown_rx).await;
            signals_handle.close();
            let report = report.context("certificate maintenance aborted")?;

            if report.failed() > 0 {
                warn!(failed = report.failed(), "Some zones failed, see last_error in status");
            }
        }
        Command::Queue(host) => {
            let zone = build_engine(&env)?
                .queue(&host)
                .with_context(|| format!("failed to queue {}", host))?;
            println!("queued {}", zone);
        }
        Command::Backfill => {
            let created = build_engine(&env)?.backfill()?;
            info!(created, "Backfilled certificate zones from active domains");
        }
    }

    Ok(())
}

/// Read-only: no directories are created and the provider is not checked
fn print_status(env: &EnvConfig) -> anyhow::Result<()> {
    let db = open_database(env)?;
    let zones = db.registry().list_all()?;
    println!("{}", serde_json::to_string_pretty(&zones)?);
    Ok(())
}

fn open_database(env: &EnvConfig) -> anyhow::Result<Database> {
    Database::open(&env.database_path)
        .with_context(|| format!("failed to open {}", env.database_path.display()))
}

fn build_engine(env: &EnvConfig) -> anyhow::Result<ProvisioningEngine> {
    let provider = wc_acme::provider::normalize(env.acme_provider.as_deref())
        .context("invalid ACME_WILDCARD_PROVIDER")?;

    env.ensure_directories()
        .context("failed to create certificate and data directories")?;

    let resolver = match &env.public_suffix_list {
        Some(path) => {
            let resolver = ZoneResolver::from_psl_file(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            info!(rules = resolver.rule_count(), "Loaded public suffix rules");
            resolver
        }
        None => ZoneResolver::new(),
    };

    let db = open_database(env)?;

    let mut runner = TokioCommandRunner::new(Duration::from_secs(env.acme_timeout_secs));
    if let Some(log) = &env.acme_log {
        runner = runner.with_log(log);
    }

    let config = EngineConfig {
        acme_bin: env.acme_bin.clone(),
        provider,
        wildcard_enabled: env.wildcard_enabled,
        cert_dir: env.cert_dir.clone(),
        renewal_period_days: env.renewal_days,
        renewal_lead_days: env.renewal_lead_days,
        process_timeout: Duration::from_secs(env.acme_timeout_secs),
        acme_server: env.acme_server.clone(),
        reload_command: env
            .reload_on_success
            .then(|| env.reload_argv())
            .filter(|argv| !argv.is_empty()),
    };

    Ok(ProvisioningEngine::new(config, &db, resolver, Arc::new(runner)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Command> {
        Command::parse(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse(&[]).unwrap(), Command::Run));
        assert!(matches!(parse(&["run"]).unwrap(), Command::Run));
        assert!(matches!(parse(&["status"]).unwrap(), Command::Status));
        assert!(matches!(parse(&["backfill"]).unwrap(), Command::Backfill));
        match parse(&["queue", "shop.example.com"]).unwrap() {
            Command::Queue(host) => assert_eq!(host, "shop.example.com"),
            _ => panic!("expected queue"),
        }
    }

    fn scratch_env(dir: &std::path::Path) -> EnvConfig {
        EnvConfig {
            database_path: dir.join("wildcert.db"),
            cert_dir: dir.join("certs"),
            acme_provider: Some("carrier-pigeon".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn test_status_touches_nothing_but_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let env = scratch_env(dir.path());

        print_status(&env).unwrap();
        assert!(!env.cert_dir.exists());
    }

    #[test]
    fn test_engine_setup_rejects_unknown_provider_before_creating_directories() {
        let dir = tempfile::tempdir().unwrap();
        let env = scratch_env(dir.path());

        assert!(build_engine(&env).is_err());
        assert!(!env.cert_dir.exists());

        let env = EnvConfig {
            acme_provider: Some("cloudflare".into()),
            ..env
        };
        let engine = build_engine(&env).unwrap();
        assert_eq!(engine.provider().as_str(), "dns_cf");
        assert!(env.cert_dir.is_dir());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&["queue"]).is_err());
        assert!(parse(&["renew"]).is_err());
        assert!(parse(&["status", "extra"]).is_err());
    }
}
