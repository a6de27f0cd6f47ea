use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use config::builder::DefaultState;
use config::{ConfigError, File, FileFormat};
use payjoin_sender::bitcoin::amount::ParseAmountError;
use payjoin_sender::bitcoin::{Amount, Denomination, FeeRate, Network};
use payjoin_sender::FeeParams;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "Payjoin sender - pay with a transaction the receiver contributes to",
    long_about = None,
    subcommand_required = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: RawConfig,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a payjoin payment
    Send {
        /// The `bitcoin:...` payjoin URI to pay
        #[arg(required = true)]
        bip21: String,

        /// The amount to send in satoshis, for URIs that do not request one
        #[arg(long, short = 'a', value_parser = parse_amount_in_sat)]
        amount: Option<Amount>,
    },
}

type Builder = config::builder::ConfigBuilder<DefaultState>;

#[derive(Debug, Clone, Parser)]
pub struct RawConfig {
    #[arg(long = "config", short = 'c', help = "Path to a TOML config file. Defaults to ./config.toml")]
    pub config_file: Option<PathBuf>,

    #[arg(long, short = 'n', help = "bitcoin, testnet, signet or regtest")]
    pub network: Option<Network>,

    #[arg(long = "esplora-url", help = "Base URL of the Esplora API used for UTXOs and broadcast")]
    pub esplora_url: Option<Url>,

    #[arg(long, help = "The sender's private key in WIF")]
    pub wif: Option<String>,

    #[arg(long = "fee-rate", short = 'f', help = "Fee rate in sat/vB")]
    pub fee_rate: Option<u64>,

    #[arg(
        long = "max-fee-contribution",
        help = "The most the receiver may add to the fee, in satoshis"
    )]
    pub max_fee_contribution: Option<u64>,

    #[arg(long = "max-fee-rate", help = "Refuse to sign above this fee rate, in sat/vB")]
    pub max_fee_rate: Option<u64>,

    #[arg(long = "timeout", help = "Seconds to wait for the receiver")]
    pub timeout_secs: Option<u64>,

    #[arg(
        long,
        help = "Broadcast the original transaction if the payjoin fails",
        action = clap::ArgAction::SetTrue
    )]
    pub fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: Network,
    pub esplora_url: Option<Url>,
    pub wif: String,
    pub fee_rate: u64,
    pub max_fee_contribution: u64,
    pub max_fee_rate: u64,
    pub timeout_secs: u64,
    pub fallback: bool,
}

impl Config {
    pub(crate) fn new(cli: &Cli) -> Result<Self> {
        let mut builder = add_defaults(config::Config::builder())?;
        builder = match &cli.config.config_file {
            Some(path) => builder.add_source(File::from(path.as_path()).format(FileFormat::Toml)),
            None =>
                builder.add_source(File::with_name("config").format(FileFormat::Toml).required(false)),
        };
        builder = add_cli_overrides(builder, &cli.config)?;

        let config: Config = builder.build()?.try_deserialize()?;
        if config.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be positive"));
        }
        tracing::debug!(network = %config.network, esplora = %config.esplora_url()?, "loaded config");
        Ok(config)
    }

    /// The configured Esplora base URL, or the public one for the configured network.
    pub fn esplora_url(&self) -> Result<Url> {
        match &self.esplora_url {
            Some(url) => Ok(url.clone()),
            None => Ok(Url::parse(default_esplora_url(self.network))?),
        }
    }

    pub fn fee_params(&self) -> Result<FeeParams> {
        let max_fee_rate = FeeRate::from_sat_per_vb(self.max_fee_rate)
            .ok_or_else(|| anyhow!("max_fee_rate {} sat/vB is out of range", self.max_fee_rate))?;
        Ok(FeeParams::new(self.fee_rate, Amount::from_sat(self.max_fee_contribution))
            .with_max_fee_rate(max_fee_rate))
    }

    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

/// Built-in defaults, lowest precedence
fn add_defaults(config: Builder) -> Result<Builder, ConfigError> {
    config
        .set_default("network", "bitcoin")?
        .set_default("fee_rate", 1_u64)?
        .set_default("max_fee_contribution", 1_000_u64)?
        .set_default("max_fee_rate", 5_000_u64)?
        .set_default("timeout_secs", 30_u64)?
        .set_default("fallback", false)
}

/// Command line flags, highest precedence
fn add_cli_overrides(config: Builder, cli: &RawConfig) -> Result<Builder, ConfigError> {
    config
        .set_override_option("network", cli.network.map(|n| n.to_string()))?
        .set_override_option("esplora_url", cli.esplora_url.as_ref().map(|u| u.as_str()))?
        .set_override_option("wif", cli.wif.clone())?
        .set_override_option("fee_rate", cli.fee_rate)?
        .set_override_option("max_fee_contribution", cli.max_fee_contribution)?
        .set_override_option("max_fee_rate", cli.max_fee_rate)?
        .set_override_option("timeout_secs", cli.timeout_secs)?
        .set_override_option("fallback", cli.fallback.then_some(true))
}

fn default_esplora_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "https://blockstream.info/api/",
        Network::Testnet => "https://blockstream.info/testnet/api/",
        Network::Signet => "https://mempool.space/signet/api/",
        _ => "http://localhost:3002/",
    }
}

fn parse_amount_in_sat(s: &str) -> Result<Amount, ParseAmountError> {
    Amount::from_str_in(s, Denomination::Satoshi)
}

#[cfg(test)]
mod test {
    use payjoin_sender::bitcoin::secp256k1::SecretKey;
    use payjoin_sender::bitcoin::PrivateKey;

    use super::*;

    const URI: &str =
        "bitcoin:bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4?amount=0.0001&pj=https://example.com/pj";

    fn wif(network: Network) -> String {
        let secret = SecretKey::from_slice(&[7; 32]).expect("valid key");
        PrivateKey::new(secret, network).to_wif()
    }

    fn parse(args: &[&str]) -> Result<Config> {
        let mut argv = vec!["payjoin-sender"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["send", URI]);
        Config::new(&Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_apply_under_flags() {
        let wif = wif(Network::Bitcoin);
        let config = parse(&["--wif", &wif]).unwrap();
        assert_eq!(config.network, Network::Bitcoin);
        assert_eq!(config.wif, wif);
        assert_eq!(config.esplora_url().unwrap().as_str(), "https://blockstream.info/api/");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.fallback);

        let fee_params = config.fee_params().unwrap();
        assert_eq!(fee_params.fee_rate_per_byte, 1);
        assert_eq!(fee_params.max_additional_fee_contribution, Amount::from_sat(1_000));
        assert_eq!(fee_params.max_fee_rate, FeeRate::from_sat_per_vb_unchecked(5_000));
    }

    #[test]
    fn wif_is_required() { assert!(parse(&[]).is_err()); }

    #[test]
    fn flags_override_config_file() {
        let path = std::env::temp_dir().join(format!("payjoin-sender-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            format!(
                "network = \"testnet\"\nwif = \"{}\"\nfee_rate = 5\ntimeout_secs = 10\n",
                wif(Network::Testnet)
            ),
        )
        .unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let config = parse(&["--config", &path_arg, "--fee-rate", "7", "--fallback"]);
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.esplora_url().unwrap().as_str(), "https://blockstream.info/testnet/api/");
        assert_eq!(config.fee_rate, 7);
        assert_eq!(config.timeout_secs, 10);
        assert!(config.fallback);
    }

    #[test]
    fn rejects_zero_timeout() {
        let wif = wif(Network::Bitcoin);
        assert!(parse(&["--wif", &wif, "--timeout", "0"]).is_err());
    }

    #[test]
    fn explicit_esplora_url_wins() {
        let wif = wif(Network::Regtest);
        let config =
            parse(&["--wif", &wif, "-n", "regtest", "--esplora-url", "http://127.0.0.1:3000/"])
                .unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.esplora_url().unwrap().as_str(), "http://127.0.0.1:3000/");
    }

    #[test]
    fn send_takes_a_bip21_uri() {
        let cli = Cli::try_parse_from(["payjoin-sender", "send", URI, "--amount", "5000"]).unwrap();
        let Commands::Send { bip21, amount } = cli.command;
        assert_eq!(bip21, URI);
        assert_eq!(amount, Some(Amount::from_sat(5_000)));
    }
}
