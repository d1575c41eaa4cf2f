#![forbid(unsafe_code)]

use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use nsalloc_contracts::allocation::NamespaceName;
use nsalloc_contracts::request::Request;
use nsalloc_engines::capacity::{CapacitySourceConfig, PrometheusCapacitySource};
use nsalloc_engines::config::AllocatorConfig;
use nsalloc_engines::notify::{sink_from_config, NotificationConfig, NotificationSink};
use nsalloc_engines::scheduler::{add_saturating, AllocationContext, SystemScheduler};
use nsalloc_os::publish::DEFAULT_ENV_FILE;
use nsalloc_os::{AllocationEngine, EnvFilePublisher, StdoutPublisher};
use nsalloc_storage::{AllocationStore, SqliteLedgerStore};

use crate::params::{EnvParameterSource, ParameterSource, YamlParameterSource};

pub type CliEngine = AllocationEngine<
    SqliteLedgerStore,
    PrometheusCapacitySource,
    Box<dyn NotificationSink + Send + Sync>,
    SystemScheduler,
>;

/// nsalloc - capacity-aware namespace allocation for shared CI clusters
#[derive(Parser, Debug)]
#[command(name = "nsalloc", version, about, long_about = None)]
pub struct Cli {
    /// SQLite ledger file
    #[arg(long, env = "NSALLOC_DB_PATH", default_value = "nsalloc.db")]
    pub db: PathBuf,

    /// Prometheus base URL; skips discovery when set
    #[arg(long, env = "NSALLOC_PROMETHEUS_URL")]
    pub prometheus_url: Option<String>,

    /// Endpoint returning {"prometheus_url": ...}
    #[arg(long, env = "NSALLOC_DISCOVERY_URL")]
    pub discovery_url: Option<String>,

    /// Webhook for queue notifications; logs only when unset
    #[arg(long, env = "NSALLOC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register the pipeline's request without waiting for capacity
    InsertOrUpdate(SourceArgs),
    /// Wait for capacity, then print and publish the granted namespace
    AllocateNamespace {
        #[command(flatten)]
        source: SourceArgs,
        /// Give up after this many minutes
        #[arg(long)]
        timeout_mins: Option<u64>,
        /// Env file that receives NAMESPACE=<name>
        #[arg(long, default_value = DEFAULT_ENV_FILE)]
        env_file: PathBuf,
    },
    /// Delete the record bound to a namespace and free it
    Delete {
        #[arg(long)]
        namespace: String,
    },
    /// Namespace pool administration
    #[command(subcommand)]
    Pool(PoolCommand),
    /// Release allocation locks older than the stale-lock timeout
    Reconcile,
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    #[arg(long, value_enum, default_value_t = SourceKind::Env)]
    pub source: SourceKind,
    /// Pipeline YAML file, required with --source yaml
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Env,
    Yaml,
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// Add namespaces to the pool as AVAILABLE
    Add {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List pool namespaces and their state
    List,
}

pub fn build_engine(cli: &Cli) -> Result<CliEngine, String> {
    let config = AllocatorConfig::from_env().map_err(|e| e.to_string())?;
    let store = SqliteLedgerStore::open(&cli.db).map_err(|e| e.to_string())?;

    let mut capacity_config = CapacitySourceConfig::from_env();
    if cli.prometheus_url.is_some() {
        capacity_config.base_url = cli.prometheus_url.clone();
    }
    if cli.discovery_url.is_some() {
        capacity_config.discovery_url = cli.discovery_url.clone();
    }
    let capacity = PrometheusCapacitySource::new(capacity_config);

    let mut notification_config = NotificationConfig::from_env();
    if cli.webhook_url.is_some() {
        notification_config.webhook_url = cli.webhook_url.clone();
    }
    let notifier = sink_from_config(&notification_config);

    AllocationEngine::new(config, store, capacity, notifier, SystemScheduler)
        .map_err(|e| e.to_string())
}

fn load_request(args: &SourceArgs, pinned_prefix: &str) -> Result<Request, String> {
    let out = match args.source {
        SourceKind::Env => EnvParameterSource.load(pinned_prefix),
        SourceKind::Yaml => {
            let path = args
                .file
                .as_ref()
                .ok_or_else(|| "--file is required with --source yaml".to_string())?;
            YamlParameterSource::new(path).load(pinned_prefix)
        }
    };
    out.map_err(|e| e.to_string())
}

/// Runs one command. Returns the lines to print on stdout.
pub fn execute(cli: Cli) -> Result<Vec<String>, String> {
    let mut engine = build_engine(&cli)?;
    match cli.command {
        Command::InsertOrUpdate(source) => {
            let request = load_request(&source, &engine.config().pinned_namespace_prefix)?;
            let record = engine
                .insert_or_update(&request)
                .map_err(|e| e.to_string())?;
            Ok(vec![format!(
                "{} {} {}",
                record.sequence_id, record.status, record.priority
            )])
        }
        Command::AllocateNamespace {
            source,
            timeout_mins,
            env_file,
        } => {
            let request = load_request(&source, &engine.config().pinned_namespace_prefix)?;
            let ctx = match timeout_mins {
                Some(mins) => AllocationContext::with_deadline(add_saturating(
                    Utc::now(),
                    std::time::Duration::from_secs(mins.saturating_mul(60)),
                )),
                None => AllocationContext::unbounded(),
            };
            let mut engine = engine
                .with_output(Box::new(EnvFilePublisher::new(env_file)))
                .with_output(Box::new(StdoutPublisher));
            engine
                .allocate(&request, &ctx)
                .map_err(|e| e.to_string())?;
            Ok(Vec::new())
        }
        Command::Delete { namespace } => {
            let name = NamespaceName::new(namespace).map_err(|e| e.to_string())?;
            let removed = engine.release(&name).map_err(|e| e.to_string())?;
            Ok(vec![match removed {
                Some(record) => format!("released {name} (record {})", record.sequence_id),
                None => format!("released {name}"),
            }])
        }
        Command::Pool(PoolCommand::Add { names }) => {
            let mut lines = Vec::with_capacity(names.len());
            for raw in names {
                let name = NamespaceName::new(raw).map_err(|e| e.to_string())?;
                engine
                    .register_namespace(&name)
                    .map_err(|e| e.to_string())?;
                lines.push(format!("added {name}"));
            }
            Ok(lines)
        }
        Command::Pool(PoolCommand::List) => {
            let rows = engine
                .store_mut()
                .transaction(|tx| tx.namespaces())
                .map_err(|e| e.to_string())?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    let lock = if row.allocation_lock { "locked" } else { "-" };
                    format!("{}\t{}\t{lock}", row.name, row.availability.as_str())
                })
                .collect())
        }
        Command::Reconcile => {
            let released = engine.reconcile_stale_locks().map_err(|e| e.to_string())?;
            Ok(released
                .into_iter()
                .map(|name| format!("unlocked {name}"))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cli(db: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec!["nsalloc", "--db", db.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn at_cli_01_parses_allocate_flags() {
        let parsed = Cli::try_parse_from([
            "nsalloc",
            "--db",
            "/tmp/x.db",
            "allocate-namespace",
            "--source",
            "yaml",
            "--file",
            "p.yml",
            "--timeout-mins",
            "90",
        ])
        .unwrap();
        match parsed.command {
            Command::AllocateNamespace {
                source,
                timeout_mins,
                env_file,
            } => {
                assert_eq!(source.source, SourceKind::Yaml);
                assert_eq!(timeout_mins, Some(90));
                assert_eq!(env_file, PathBuf::from(DEFAULT_ENV_FILE));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["nsalloc", "pool", "add"]).is_err());
    }

    #[test]
    fn at_cli_02_pool_and_registration_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        let added = execute(cli(&db, &["pool", "add", "o-devops-pol1", "o-devops-pol2"])).unwrap();
        assert_eq!(added.len(), 2);
        let listed = execute(cli(&db, &["pool", "list"])).unwrap();
        assert_eq!(listed, vec!["o-devops-pol1\tAVAILABLE\t-", "o-devops-pol2\tAVAILABLE\t-"]);

        let yaml = dir.path().join("pipeline.yml");
        fs::write(
            &yaml,
            "job:\n  variables:\n    BUILD_NF: policy\n    POLICY_RELEASE_TAG: \"24.1.2\"\n    REPORT: \"true\"\n",
        )
        .unwrap();
        let out = execute(cli(
            &db,
            &["insert-or-update", "--source", "yaml", "--file", yaml.to_str().unwrap()],
        ))
        .unwrap();
        assert_eq!(out, vec!["1 YET_TO_ASSIGN CRITICAL"]);

        assert!(execute(cli(&db, &["delete", "--namespace", "o-devops-pol9"])).is_err());
        assert!(execute(cli(&db, &["reconcile"])).unwrap().is_empty());
    }

    #[test]
    fn at_cli_03_yaml_source_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        let err = execute(cli(&db, &["insert-or-update", "--source", "yaml"])).unwrap_err();
        assert!(err.contains("--file"));
    }
}
