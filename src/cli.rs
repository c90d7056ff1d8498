use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::Config;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on for scrape requests
    #[arg(long, env = "NFTABLES_EXPORTER_ADDRESS", default_value = "0.0.0.0")]
    pub address: IpAddr,

    #[arg(long, env = "NFTABLES_EXPORTER_PORT", default_value_t = 9630)]
    pub port: u16,

    /// Seconds between two ruleset refreshes
    #[arg(long, env = "NFTABLES_EXPORTER_UPDATE_PERIOD", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub update_period: u64,

    /// Prefix of every ruleset metric name, `[a-zA-Z_][a-zA-Z0-9_]*`
    #[arg(long, env = "NFTABLES_EXPORTER_NAMESPACE", default_value = "nftables", value_parser = parse_namespace)]
    pub namespace: String,

    #[arg(long, env = "NFTABLES_EXPORTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "NFTABLES_EXPORTER_NFT_PATH", default_value = "nft")]
    pub nft_path: PathBuf,

    /// Seconds before a running `nft` call is killed
    #[arg(long, env = "NFTABLES_EXPORTER_NFT_TIMEOUT", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub nft_timeout: u64,

    /// MaxMind country database (.mmdb), enables the `country` label
    #[arg(long, env = "NFTABLES_EXPORTER_GEOIP_DATABASE")]
    pub geoip_database: Option<PathBuf>,
}

fn parse_namespace(value: &str) -> Result<String, String> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(value.to_string())
    } else {
        Err(format!("`{value}` is not a valid metric name prefix"))
    }
}

impl From<Cli> for Config {
    fn from(args: Cli) -> Self {
        Self {
            listen_addr: SocketAddr::new(args.address, args.port),
            update_period: Duration::from_secs(args.update_period),
            namespace: args.namespace,
            nft_path: args.nft_path,
            nft_timeout: Duration::from_secs(args.nft_timeout),
            geoip_database: args.geoip_database,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::{CommandFactory, Parser};

    use super::Cli;
    use crate::Config;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_to_config() {
        let args = Cli::try_parse_from([
            "nftables-exporter",
            "--address",
            "127.0.0.1",
            "--port",
            "9100",
            "--update-period",
            "15",
            "--namespace",
            "fw",
            "--geoip-database",
            "/var/lib/GeoIP/GeoLite2-Country.mmdb",
        ])
        .unwrap();
        let config = Config::from(args);

        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.update_period, Duration::from_secs(15));
        assert_eq!(config.namespace, "fw");
        assert!(config.geoip_database.is_some());
    }

    #[test]
    fn rejects_invalid_namespace() {
        for namespace in ["my-fw", "9fw", "", "fw.v4"] {
            assert!(
                Cli::try_parse_from(["nftables-exporter", "--namespace", namespace]).is_err(),
                "{namespace:?} accepted"
            );
        }
        let args = Cli::try_parse_from(["nftables-exporter", "--namespace", "_fw_1"]).unwrap();
        assert_eq!(args.namespace, "_fw_1");
    }

    #[test]
    fn rejects_zero_period() {
        assert!(Cli::try_parse_from(["nftables-exporter", "--update-period", "0"]).is_err());
    }
}
