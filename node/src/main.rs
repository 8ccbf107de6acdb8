use anyhow::{Context as _, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use meshd_network::{HelloHandshake, MeshConfig, MeshNode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{long_version, MESHD_VERSION};

const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
struct AppConfig {
    mesh: MeshConfig,
    /// Addresses connected to at startup, bypassing discovery.
    peers: Vec<SocketAddr>,
    log_level: String,
    log_format: String,
    /// Zero disables the periodic stats refresh.
    stats_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            peers: Vec::new(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

impl AppConfig {
    fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }

        builder = builder.add_source(config::Environment::with_prefix("MESHD"));

        let config = builder.build()?;
        Self::from_config(&config)
    }

    fn from_config(config: &Config) -> Result<Self> {
        let defaults = AppConfig::default();
        let mesh_defaults = defaults.mesh.clone();

        let port = match get_string_value(config, &["PORT", "node.port"]) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("Invalid port {}", raw))?,
            None => mesh_defaults.port,
        };
        let connect_timeout_ms =
            match get_string_value(config, &["CONNECT_TIMEOUT_MS", "node.connect_timeout_ms"]) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("Invalid connect timeout {}", raw))?,
                None => mesh_defaults.connect_timeout_ms,
            };
        let stats_interval_secs =
            match get_string_value(config, &["STATS_INTERVAL_SECS", "stats.interval_secs"]) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("Invalid stats interval {}", raw))?,
                None => defaults.stats_interval_secs,
            };

        let mesh = MeshConfig {
            base_id: get_string_value(config, &["BASE_ID", "node.base_id"]),
            port,
            root_dir: get_string_value(config, &["ROOT_DIR", "node.root_dir"]).map(PathBuf::from),
            interfaces: get_list_value(config, &["NETIF", "node.interfaces"]),
            allow_peer_local: get_bool_value(
                config,
                &["ALLOW_PEER_LOCAL", "node.allow_peer_local"],
                mesh_defaults.allow_peer_local,
            ),
            connect_timeout_ms,
            namespace: get_string_value(config, &["NAMESPACE", "node.namespace"])
                .unwrap_or(mesh_defaults.namespace),
            install_exit_hook: get_bool_value(
                config,
                &["INSTALL_EXIT_HOOK", "node.install_exit_hook"],
                mesh_defaults.install_exit_hook,
            ),
        };

        Ok(Self {
            mesh,
            peers: parse_peers(&get_list_value(config, &["PEERS", "node.peers"]))?,
            log_level: get_string_value(config, &["LOG_LEVEL", "log.level"])
                .unwrap_or(defaults.log_level),
            log_format: get_string_value(config, &["LOG_FORMAT", "log.format"])
                .unwrap_or(defaults.log_format),
            stats_interval_secs,
        })
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

/// Array values from files, or comma-separated strings from the environment.
fn get_list_value(config: &Config, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Ok(values) = config.get_array(key) {
            return values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }
        if let Some(raw) = get_string_value(config, &[*key]) {
            return raw
                .split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }
    }
    Vec::new()
}

/// Runs before logging is up, so a bad entry fails the load instead of
/// being reported.
fn parse_peers(values: &[String]) -> Result<Vec<SocketAddr>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid peer address {}", value))
        })
        .collect()
}

fn build_cli() -> Command {
    Command::new("meshd")
        .version(MESHD_VERSION)
        .about("Mesh overlay node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Listening port (0 picks a free port)"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIR")
                .help("Root directory served through the local file system"),
        )
        .arg(
            Arg::new("netif")
                .long("netif")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Bind the addresses of this interface (repeatable)"),
        )
        .arg(
            Arg::new("peer")
                .long("peer")
                .value_name("ADDR")
                .value_parser(value_parser!(SocketAddr))
                .action(ArgAction::Append)
                .help("Connect to this peer at startup (repeatable)"),
        )
        .arg(
            Arg::new("no-local-peering")
                .long("no-local-peering")
                .action(ArgAction::SetTrue)
                .help("Refuse to peer with addresses on this host's segment"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Override the log format"),
        )
        .arg(
            Arg::new("stats-interval-secs")
                .long("stats-interval-secs")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Stats refresh interval in seconds (0 disables)"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(port) = matches.get_one::<u16>("port") {
        config.mesh.port = *port;
    }

    if let Some(root) = matches.get_one::<String>("root") {
        config.mesh.root_dir = Some(PathBuf::from(root));
    }

    if let Some(netifs) = matches.get_many::<String>("netif") {
        config.mesh.interfaces = netifs.cloned().collect();
    }

    if let Some(peers) = matches.get_many::<SocketAddr>("peer") {
        config.peers.extend(peers.copied());
    }

    if matches.get_flag("no-local-peering") {
        config.mesh.allow_peer_local = false;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(secs) = matches.get_one::<u64>("stats-interval-secs") {
        config.stats_interval_secs = *secs;
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn spawn_stats_refresh(node: &Arc<MeshNode>, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    let node = Arc::clone(node);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if node.is_closed() {
                break;
            }
            node.group().refresh_stats();
            for line in node.group().last_stats() {
                debug!("{}", line);
            }
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!("Starting meshd {}", long_version());

    let node = MeshNode::builder(config.mesh.clone())
        .handshake(Arc::new(HelloHandshake::new()))
        .start()
        .await
        .context("Failed to start mesh node")?;

    for peer in config.peers.iter().copied() {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if node.connect_peer(peer).await {
                info!("{} connected to forced peer {}", node, peer);
            }
        });
    }

    let stats_refresh = spawn_stats_refresh(&node, config.stats_interval_secs);

    info!("meshd node {} is ready on {:?}", node.id(), node.local_addrs());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down meshd");
        }
        _ = node.wait_closed() => {
            info!("Mesh node closed");
        }
    }

    if let Some(handle) = stats_refresh {
        handle.abort();
    }
    node.close().await;

    Ok(())
}
