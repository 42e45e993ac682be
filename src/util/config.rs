// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Process configuration, sourced entirely from the environment (directly,
//! or via `--flag` for local testing). Unlike a node that takes a config
//! file and a data directory as positional arguments, this process is a
//! long-running server with no positional CLI argument at all.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Raw CLI/env arguments. Every field is optional here; [`load_config`]
/// fills in defaults and validates before producing a [`Config`].
#[derive(Parser, Debug, Default)]
#[command(version, about = "Metered reverse proxy for LLM inference APIs", long_about = None)]
pub struct ArgsConfig {
	#[arg(long, env = "METERPROXY_LISTEN_ADDR", help = "HTTP bind address.")]
	pub listen_addr: Option<String>,

	#[arg(long, env = "METERPROXY_DATABASE_PATH", help = "SQLite file path for the credit store.")]
	pub database_path: Option<String>,

	#[arg(long, env = "METERPROXY_UPSTREAM_BASE_URL", help = "Default upstream base URL.")]
	pub upstream_base_url: Option<String>,

	#[arg(long, env = "METERPROXY_UPSTREAM_API_KEY", help = "Default upstream API key.")]
	pub upstream_api_key: Option<String>,

	#[arg(
		long,
		env = "METERPROXY_UPSTREAM_PROVIDER_TYPE",
		help = "Default upstream provider type (e.g. \"openai\")."
	)]
	pub upstream_provider_type: Option<String>,

	#[arg(long, env = "METERPROXY_UPSTREAM_FEE_MULTIPLIER", help = "Default upstream fee multiplier.")]
	pub upstream_fee_multiplier: Option<f64>,

	#[arg(
		long,
		env = "METERPROXY_MINT_URLS",
		value_delimiter = ',',
		help = "Comma-separated list of mints the wallet primitive is willing to redeem/mint against."
	)]
	pub mint_urls: Option<Vec<String>>,

	#[arg(
		long,
		env = "METERPROXY_RELAY_URLS",
		value_delimiter = ',',
		help = "Comma-separated list of Nostr relays announcements are published to."
	)]
	pub relay_urls: Option<Vec<String>>,

	#[arg(
		long,
		env = "METERPROXY_ANNOUNCEMENT_PRIVATE_KEY",
		help = "Hex secp256k1 private key used to sign provider announcements. Unset disables announcing."
	)]
	pub announcement_private_key: Option<String>,

	#[arg(
		long,
		env = "METERPROXY_ADMIN_PASSWORD",
		help = "Bearer required for the admin-owned catalog settings surface."
	)]
	pub admin_password: Option<String>,

	#[arg(long, env = "METERPROXY_PRICE_REFRESH_SECS", help = "Price-oracle refresh period, in seconds.")]
	pub price_refresh_secs: Option<u64>,

	#[arg(long, env = "METERPROXY_ANNOUNCE_INTERVAL_SECS", help = "Announcement republish period, in seconds.")]
	pub announce_interval_secs: Option<u64>,

	#[arg(long, env = "METERPROXY_PROCESSING_FEE_MSAT", help = "Ephemeral-path processing fee, in millisatoshis.")]
	pub processing_fee_msat: Option<i64>,

	#[arg(long, env = "METERPROXY_REFUND_CACHE_TTL_SECS", help = "Refund idempotency cache TTL, in seconds.")]
	pub refund_cache_ttl_secs: Option<u64>,
}

/// Fully validated, defaulted configuration (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub database_path: PathBuf,
	pub upstream_base_url: Option<String>,
	pub upstream_api_key: Option<String>,
	pub upstream_provider_type: Option<String>,
	pub upstream_fee_multiplier: Option<f64>,
	pub mint_urls: Vec<String>,
	pub relay_urls: Vec<String>,
	pub announcement_private_key: Option<String>,
	pub admin_password: Option<String>,
	pub price_refresh: Duration,
	pub announce_interval: Duration,
	pub processing_fee_msat: i64,
	pub refund_cache_ttl: Duration,
}

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATABASE_PATH: &str = "meterproxy.sqlite3";
const DEFAULT_PRICE_REFRESH_SECS: u64 = 60;
const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 3600;

pub fn load_config(args: &ArgsConfig) -> io::Result<Config> {
	let listen_addr = args
		.listen_addr
		.clone()
		.unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
		.parse::<SocketAddr>()
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid METERPROXY_LISTEN_ADDR: {e}")))?;

	let database_path =
		PathBuf::from(args.database_path.clone().unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()));

	if let Some(multiplier) = args.upstream_fee_multiplier {
		if multiplier < 0.0 {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"METERPROXY_UPSTREAM_FEE_MULTIPLIER must not be negative",
			));
		}
	}

	let mint_urls = args.mint_urls.clone().unwrap_or_default();
	let relay_urls = args.relay_urls.clone().unwrap_or_default();

	if let Some(key) = &args.announcement_private_key {
		if key.trim().is_empty() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"METERPROXY_ANNOUNCEMENT_PRIVATE_KEY must not be empty when set",
			));
		}
	}

	let price_refresh = Duration::from_secs(args.price_refresh_secs.unwrap_or(DEFAULT_PRICE_REFRESH_SECS));
	let announce_interval =
		Duration::from_secs(args.announce_interval_secs.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL_SECS));
	let processing_fee_msat = args.processing_fee_msat.unwrap_or(crate::ephemeral::DEFAULT_PROCESSING_FEE_MSAT);
	let refund_cache_ttl = Duration::from_secs(args.refund_cache_ttl_secs.unwrap_or(5 * 60));

	Ok(Config {
		listen_addr,
		database_path,
		upstream_base_url: args.upstream_base_url.clone(),
		upstream_api_key: args.upstream_api_key.clone(),
		upstream_provider_type: args.upstream_provider_type.clone(),
		upstream_fee_multiplier: args.upstream_fee_multiplier,
		mint_urls,
		relay_urls,
		announcement_private_key: args.announcement_private_key.clone(),
		admin_password: args.admin_password.clone(),
		price_refresh,
		announce_interval,
		processing_fee_msat,
		refund_cache_ttl,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn empty_args() -> ArgsConfig {
		ArgsConfig::default()
	}

	#[test]
	fn defaults_apply_when_nothing_set() {
		let config = load_config(&empty_args()).unwrap();
		assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse::<SocketAddr>().unwrap());
		assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
		assert!(config.mint_urls.is_empty());
		assert!(config.relay_urls.is_empty());
		assert_eq!(config.processing_fee_msat, crate::ephemeral::DEFAULT_PROCESSING_FEE_MSAT);
		assert_eq!(config.refund_cache_ttl, Duration::from_secs(5 * 60));
	}

	#[test]
	fn rejects_invalid_listen_addr() {
		let mut args = empty_args();
		args.listen_addr = Some("not-an-addr".to_string());
		let err = load_config(&args).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}

	#[test]
	fn rejects_negative_fee_multiplier() {
		let mut args = empty_args();
		args.upstream_fee_multiplier = Some(-1.0);
		let err = load_config(&args).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}

	#[test]
	fn splits_comma_separated_lists() {
		let mut args = empty_args();
		args.mint_urls = Some(vec!["https://a.example".to_string(), "https://b.example".to_string()]);
		let config = load_config(&args).unwrap();
		assert_eq!(config.mint_urls, vec!["https://a.example", "https://b.example"]);
	}
}
