use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use clap::{Arg, Parser};
use url::Url;
use wagerpool::{
    node::{self, DEFAULT_RECENT_CAPACITY},
    types::Address,
    validation::AddressValidator,
};

const DEFAULT_RPC_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 6160);

const DEFAULT_TIMELINE_INTERVAL_SECS: u64 = 5;

const DEFAULT_CUSTODY_TIMEOUT_SECS: u64 = 30;

static DEFAULT_DATA_DIR: LazyLock<Option<PathBuf>> =
    LazyLock::new(|| match dirs::data_dir() {
        None => {
            tracing::warn!("Failed to resolve default data dir");
            None
        }
        Some(data_dir) => Some(data_dir.join("wagerpool")),
    });

/// Implement arg manually so that there is only a default if we can resolve
/// the default data dir
#[derive(Clone, Debug)]
struct DatadirArg(PathBuf);

impl clap::FromArgMatches for DatadirArg {
    fn from_arg_matches(
        matches: &clap::ArgMatches,
    ) -> Result<Self, clap::Error> {
        let mut matches = matches.clone();
        Self::from_arg_matches_mut(&mut matches)
    }

    fn from_arg_matches_mut(
        matches: &mut clap::ArgMatches,
    ) -> Result<Self, clap::Error> {
        let datadir = matches
            .remove_one::<PathBuf>("DATADIR")
            .ok_or_else(|| {
                clap::Error::raw(
                    clap::error::ErrorKind::MissingRequiredArgument,
                    "data directory is required",
                )
            })?;
        Ok(Self(datadir))
    }

    fn update_from_arg_matches(
        &mut self,
        matches: &clap::ArgMatches,
    ) -> Result<(), clap::Error> {
        let mut matches = matches.clone();
        self.update_from_arg_matches_mut(&mut matches)
    }

    fn update_from_arg_matches_mut(
        &mut self,
        matches: &mut clap::ArgMatches,
    ) -> Result<(), clap::Error> {
        if let Some(datadir) = matches.remove_one("DATADIR") {
            self.0 = datadir;
        }
        Ok(())
    }
}

impl clap::Args for DatadirArg {
    fn augment_args(cmd: clap::Command) -> clap::Command {
        cmd.arg({
            let arg = Arg::new("DATADIR")
                .value_parser(clap::builder::PathBufValueParser::new())
                .long("datadir")
                .short('d')
                .help("Data directory for storing the competition store");
            match &*DEFAULT_DATA_DIR {
                Some(datadir) => {
                    arg.required(false).default_value(datadir.as_os_str())
                }
                None => arg.required(true),
            }
        })
    }

    fn augment_args_for_update(cmd: clap::Command) -> clap::Command {
        Self::augment_args(cmd)
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub(super) struct Cli {
    #[command(flatten)]
    datadir: DatadirArg,
    /// Address of the JSON-RPC server
    #[arg(default_value_t = DEFAULT_RPC_ADDR, long)]
    rpc_addr: SocketAddr,
    /// Log level, or an `EnvFilter` directive
    #[arg(default_value = "info", long)]
    log_level: String,
    /// Also write daily-rotated logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
    /// URL of the external custody service. An in-memory custody is used
    /// when unset.
    #[arg(long)]
    custody_url: Option<Url>,
    #[arg(default_value_t = DEFAULT_CUSTODY_TIMEOUT_SECS, long)]
    custody_timeout_secs: u64,
    /// Owner of every competition vault; repeatable
    #[arg(long = "vault-owner")]
    vault_owners: Vec<String>,
    #[arg(default_value_t = 1, long)]
    vault_threshold: u32,
    /// Receives platform fees and proposes settlements
    #[arg(long)]
    platform_address: Option<String>,
    /// Events cached per competition for `recent_events`
    #[arg(default_value_t = DEFAULT_RECENT_CAPACITY, long)]
    recent_events: usize,
    #[arg(default_value_t = 1024, long)]
    map_size_mb: usize,
    /// Seconds between timeline sweeps
    #[arg(default_value_t = DEFAULT_TIMELINE_INTERVAL_SECS, long)]
    timeline_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_addr: SocketAddr,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
    pub custody_url: Option<Url>,
    pub custody_timeout: Duration,
    pub timeline_interval: Duration,
    pub node: node::Config,
}

impl Cli {
    pub fn get_config(self) -> anyhow::Result<Config> {
        let vault_owners = AddressValidator::parse_all(&self.vault_owners)?;
        let platform_address = self
            .platform_address
            .as_deref()
            .map(AddressValidator::parse)
            .transpose()?;
        if !vault_owners.is_empty()
            && (self.vault_threshold == 0
                || self.vault_threshold as usize > vault_owners.len())
        {
            anyhow::bail!(
                "vault threshold {} must be between 1 and {} owners",
                self.vault_threshold,
                vault_owners.len()
            );
        }
        Ok(Config {
            rpc_addr: self.rpc_addr,
            log_level: self.log_level,
            log_dir: self.log_dir,
            log_json: self.log_json,
            custody_url: self.custody_url,
            custody_timeout: Duration::from_secs(self.custody_timeout_secs),
            timeline_interval: Duration::from_secs(
                self.timeline_interval_secs.max(1),
            ),
            node: node::Config {
                datadir: self.datadir.0,
                map_size_mb: self.map_size_mb,
                recent_events: self.recent_events,
                vault_owners,
                vault_threshold: self.vault_threshold,
                platform_address,
            },
        })
    }
}

impl Config {
    /// Custody settings, for the startup log
    pub fn custody_summary(&self) -> String {
        let owners: Vec<&str> = self
            .node
            .vault_owners
            .iter()
            .map(Address::as_str)
            .collect();
        format!(
            "custody={} owners=[{}] threshold={}",
            self.custody_url
                .as_ref()
                .map_or("memory", |url| url.as_str()),
            owners.join(","),
            self.node.vault_threshold
        )
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::Cli;

    #[test]
    fn vault_threshold_cannot_exceed_owners() {
        let cli = Cli::try_parse_from([
            "wagerpool_app",
            "--datadir",
            "/tmp/wagerpool",
            "--vault-owner",
            "0x00000000000000000000000000000000000000aa",
            "--vault-threshold",
            "2",
        ])
        .unwrap();
        assert!(cli.get_config().is_err());
    }

    #[test]
    fn owners_are_normalized() {
        let cli = Cli::try_parse_from([
            "wagerpool_app",
            "--datadir",
            "/tmp/wagerpool",
            "--vault-owner",
            "0x00000000000000000000000000000000000000AA",
            "--platform-address",
            "0x00000000000000000000000000000000000000BB",
        ])
        .unwrap();
        let config = cli.get_config().unwrap();
        assert_eq!(
            config.node.vault_owners[0].as_str(),
            "0x00000000000000000000000000000000000000aa"
        );
        assert!(config.node.platform_address.is_some());
        assert!(config.custody_summary().starts_with("custody=memory"));
    }
}
