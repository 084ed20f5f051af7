//! Configuration loading and parsing.
//!
//! Loads configuration from files, environment variables and command-line
//! arguments, with proper precedence handling.

use anyhow::{Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::Path;

use super::ServerConfig;
use crate::netio::{AddressFamily, Backend};

/// Command-line interface for the engine.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "quicloop.toml")]
    pub config: String,

    /// UDP port to serve (overrides config file)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Address family: unspec, v4 or v6 (overrides config file)
    #[arg(long)]
    pub family: Option<AddressFamily>,

    /// Transport backend: socket or nic (overrides config file)
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<Backend>,

    /// Number of packet loop workers (overrides config file)
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// Outbound interface index (overrides config file)
    #[arg(long)]
    pub dest_if: Option<u32>,

    /// Kernel socket buffer size in bytes (overrides config file)
    #[arg(long)]
    pub socket_buffer_size: Option<usize>,

    /// Never use UDP segmentation offload
    #[arg(long)]
    pub disable_gso: bool,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    match s.to_lowercase().as_str() {
        "socket" | "sockets" => Ok(Backend::Socket),
        "nic" => Ok(Backend::Nic),
        _ => Err(format!("Invalid backend: {}", s)),
    }
}

/// Parse the process arguments and load the configuration.
///
/// Handles `--print-default-config` and `--validate`, both of which exit.
pub fn load_config() -> Result<ServerConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = load_config_from(&cli)?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Load and validate configuration for already-parsed arguments.
///
/// Precedence, lowest first:
/// 1. Default values
/// 2. Configuration file
/// 3. Environment variables (`QUICLOOP_` prefix, `__` separator)
/// 4. Command-line arguments
pub fn load_config_from(cli: &CliArgs) -> Result<ServerConfig> {
    let mut config = load_config_file(&cli.config)?;

    apply_env_overrides(&mut config)?;

    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Load configuration from a TOML file. A missing file means defaults.
pub fn load_config_file(path: &str) -> Result<ServerConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(ServerConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Examples:
/// - `QUICLOOP_GLOBAL__NETWORK__PORT=4433`
/// - `QUICLOOP_GLOBAL__NETIO__WORKERS=4`
/// - `QUICLOOP_GLOBAL__LOGGING__LEVEL=debug`
fn apply_env_overrides(config: &mut ServerConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix("QUICLOOP").separator("__"))
        .build()
        .context("Failed to load environment variables")?;

    let global = &mut config.global;

    if let Ok(port) = env_config.get_int("global.network.port") {
        match u16::try_from(port) {
            Ok(port) => global.network.port = port,
            Err(_) => tracing::warn!(port, "Ignoring out-of-range port from environment"),
        }
    }
    if let Ok(family) = env_config.get_string("global.network.family") {
        match family.parse() {
            Ok(family) => global.network.family = family,
            Err(e) => tracing::warn!(error = %e, "Ignoring address family from environment"),
        }
    }
    if let Ok(dest_if) = env_config.get_int("global.network.dest_if") {
        if let Ok(dest_if) = u32::try_from(dest_if) {
            global.network.dest_if = dest_if;
        }
    }
    if let Ok(backend) = env_config.get_string("global.netio.backend") {
        match parse_backend(&backend) {
            Ok(backend) => global.netio.backend = backend,
            Err(e) => tracing::warn!(error = %e, "Ignoring backend from environment"),
        }
    }
    if let Ok(workers) = env_config.get_int("global.netio.workers") {
        if let Ok(workers) = usize::try_from(workers) {
            global.netio.workers = workers;
        }
    }
    if let Ok(disable) = env_config.get_bool("global.netio.disable_gso") {
        global.netio.disable_gso = disable;
    }
    if let Ok(queues) = env_config.get_int("global.nic.queues") {
        if let Ok(queues) = u16::try_from(queues) {
            global.nic.queues = queues;
        }
    }
    if let Ok(level) = env_config.get_string("global.logging.level") {
        if let Ok(parsed_level) = level.parse() {
            global.logging.level = parsed_level;
        }
    }

    Ok(())
}

/// Apply command-line argument overrides.
fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    let global = &mut config.global;

    if let Some(port) = cli.port {
        global.network.port = port;
    }
    if let Some(family) = cli.family {
        global.network.family = family;
    }
    if let Some(dest_if) = cli.dest_if {
        global.network.dest_if = dest_if;
    }
    if let Some(backend) = cli.backend {
        global.netio.backend = backend;
    }
    if let Some(workers) = cli.workers {
        global.netio.workers = workers;
    }
    if let Some(size) = cli.socket_buffer_size {
        global.netio.socket_buffer_size = Some(size);
    }
    if cli.disable_gso {
        global.netio.disable_gso = true;
    }
    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            global.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    let default_config = ServerConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
