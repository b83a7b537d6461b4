use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use memsync_client::{DefaultClient, StorageClient};
use memsync_core::{
    config::{SessionConfig, DEFAULT_DATABASE, DEFAULT_STALENESS},
    errors::{ClientError, Operation},
    traits::{AccountService, RemoteStore},
};
use memsync_storage_ephemeral::EphemeralStore;
use memsync_storage_git::GitStore;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Git,
    Ephemeral,
}

#[derive(Parser, Debug)]
#[command(name = "memsync", version, about = "Remote-synced key-value store client")]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(flatten)]
    conn: ConnArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct ConnArgs {
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,
    #[arg(long, global = true, help = "Local working tree for the git backend")]
    root: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Remote address (file:///path or a git URL)"
    )]
    host: Option<String>,
    #[arg(long, global = true)]
    database: Option<String>,
    #[arg(long = "no-auto-sync", global = true)]
    no_auto_sync: bool,
    #[arg(long = "staleness-secs", global = true, value_name = "SECS")]
    staleness_secs: Option<u64>,
    #[arg(long = "device-id", global = true)]
    device_id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    Sync,
    Status,
    Reset {
        #[arg(long, help = "Confirm wiping local and remote data")]
        yes: bool,
    },
    Whoami,
    Keys,
    UnlinkKey { id: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RemoteSection {
    host: Option<String>,
    database: Option<String>,
    auto_sync: Option<bool>,
    staleness_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StorageSection {
    backend: Option<Backend>,
    root: Option<String>,
    device_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AppConfig {
    #[serde(default)]
    remote: Option<RemoteSection>,
    #[serde(default)]
    storage: Option<StorageSection>,
}

/// Flags win over the config file and environment, which win over defaults.
#[derive(Clone, Debug)]
struct Settings {
    backend: Backend,
    root: PathBuf,
    host: String,
    database: String,
    auto_sync: bool,
    staleness: Duration,
    device_id: Option<String>,
}

impl Settings {
    fn resolve(conn: &ConnArgs, cfg: &AppConfig) -> Self {
        let remote = cfg.remote.clone().unwrap_or_default();
        let storage = cfg.storage.clone().unwrap_or_default();
        let root = expand_path(
            conn.root
                .as_deref()
                .or(storage.root.as_deref())
                .unwrap_or("./memsync-data"),
        );
        let host = conn.host.clone().or(remote.host).unwrap_or_else(|| {
            let abs = if root.is_absolute() {
                root.clone()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(&root))
                    .unwrap_or_else(|_| root.clone())
            };
            format!("file://{}", abs.join("remote").display())
        });
        Self {
            backend: conn.backend.or(storage.backend).unwrap_or(Backend::Git),
            root,
            host,
            database: conn
                .database
                .clone()
                .or(remote.database)
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            auto_sync: !conn.no_auto_sync && remote.auto_sync.unwrap_or(true),
            staleness: conn
                .staleness_secs
                .or(remote.staleness_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STALENESS),
            device_id: conn.device_id.clone().or(storage.device_id),
        }
    }

    fn session_config(&self) -> Result<SessionConfig, ClientError> {
        Ok(SessionConfig::new(&self.host, &self.database)?
            .with_auto_sync(self.auto_sync)
            .with_staleness(self.staleness))
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let cfg = load_config(cli.config.as_deref())?.unwrap_or_default();
    let settings = Settings::resolve(&cli.conn, &cfg);
    tracing::debug!(?settings, "resolved settings");

    match settings.backend {
        Backend::Git => {
            let s = settings.clone();
            let accessor = DefaultClient::new(move || {
                let mut store = GitStore::new(&s.root)
                    .map_err(|e| ClientError::connectivity(Operation::Open, None, e))?;
                if let Some(id) = &s.device_id {
                    store.set_device_id(id);
                }
                Ok(StorageClient::new(s.session_config()?, store))
            });
            run(&accessor, cli.command)
        }
        Backend::Ephemeral => {
            let s = settings.clone();
            let accessor = DefaultClient::new(move || {
                Ok(StorageClient::new(s.session_config()?, EphemeralStore::new()))
            });
            run(&accessor, cli.command)
        }
    }
}

fn run<S>(accessor: &DefaultClient<S>, command: Commands) -> Result<()>
where
    S: RemoteStore + AccountService,
{
    let client = accessor.get()?;
    match command {
        Commands::Get { key } => match client.get(&key)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => return Err(eyre!("not found: {key}")),
        },
        Commands::Set { key, value } => {
            client.set(&key, value.as_bytes())?;
            info!(key = %key, "stored");
        }
        Commands::Delete { key } => {
            client.delete(&key)?;
            info!(key = %key, "deleted");
        }
        Commands::List { prefix } => {
            let mut keys = client.list_keys(&prefix)?;
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Sync => {
            client.sync()?;
            println!("synced");
        }
        Commands::Status => {
            let cfg = client.config();
            let last = client
                .last_synced_at()?
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into());
            println!("database: {}", cfg.database());
            println!("host: {}", cfg.host());
            println!("auto_sync: {}", cfg.auto_sync());
            println!("staleness_secs: {}", cfg.staleness().as_secs());
            println!("last_sync: {last}");
            println!("stale: {}", client.is_stale()?);
        }
        Commands::Reset { yes } => {
            if !yes {
                return Err(eyre!("reset wipes local and remote data; pass --yes to confirm"));
            }
            client.reset()?;
            println!("reset {}", client.config().database());
        }
        Commands::Whoami => println!("{}", client.id()?),
        Commands::Keys => {
            for key in client.list_authorized_keys()? {
                println!(
                    "{}\t{}\t{}",
                    key.id,
                    key.label.as_deref().unwrap_or("-"),
                    key.added_at.to_rfc3339()
                );
            }
        }
        Commands::UnlinkKey { id } => {
            client.unlink_key(&id)?;
            println!("unlinked {id}");
        }
    }
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<Option<AppConfig>> {
    let mut builder = config::Config::builder().add_source(
        config::Environment::with_prefix("MEMSYNC")
            .separator("__")
            .try_parsing(true),
    );

    let mut has_sources = false;
    if let Some(raw) = path {
        let expanded = expand_path(raw);
        has_sources = true;
        if !expanded.exists() {
            tracing::warn!(
                path = expanded.display().to_string(),
                "config file not found; continuing with defaults and env overrides"
            );
        }
        builder = builder.add_source(config::File::from(expanded).required(false));
    }

    let cfg = builder
        .build()
        .map_err(|e| eyre!("config load error: {}", e))?;
    let parsed: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| eyre!("config parse error: {}", e))?;
    if has_sources || parsed.remote.is_some() || parsed.storage.is_some() {
        return Ok(Some(parsed));
    }
    Ok(None)
}

fn expand_path(input: &str) -> PathBuf {
    if input == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from(input));
    }
    if let Some(rest) = input.strip_prefix("~/") {
        return home_dir()
            .map(|mut base| {
                base.push(rest);
                base
            })
            .unwrap_or_else(|| PathBuf::from(rest));
    }
    PathBuf::from(input)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}
