// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

mod announce;
mod api;
mod auth;
mod catalog;
mod cost;
mod credit;
mod ephemeral;
mod payment_methods;
mod price_oracle;
mod refund;
mod router;
mod service;
mod telemetry;
mod util;
mod wallet;

use std::sync::Arc;

use clap::Parser;
use rand::Rng;

use crate::announce::AnnouncementSpec;
use crate::catalog::Catalog;
use crate::credit::CreditStore;
use crate::payment_methods::PaymentMethodRegistry;
use crate::price_oracle::{HttpExchangeSource, PriceOracle};
use crate::refund::RefundCache;
use crate::service::AppState;
use crate::util::config::{load_config, ArgsConfig};
use crate::util::metrics::Metrics;
use crate::wallet::cashu::CashuWallet;

fn default_exchange_sources(client: reqwest::Client) -> Vec<Arc<dyn price_oracle::ExchangeSource>> {
	vec![
		Arc::new(HttpExchangeSource {
			name: "kraken",
			url: "https://api.kraken.com/0/public/Ticker?pair=XBTUSD".to_string(),
			client: client.clone(),
			extract: |body| body.get("result")?.get("XXBTZUSD")?.get("c")?.get(0)?.as_str()?.parse().ok(),
		}),
		Arc::new(HttpExchangeSource {
			name: "coinbase",
			url: "https://api.coinbase.com/v2/prices/BTC-USD/spot".to_string(),
			client: client.clone(),
			extract: |body| body.get("data")?.get("amount")?.as_str()?.parse().ok(),
		}),
		Arc::new(HttpExchangeSource {
			name: "binance",
			url: "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT".to_string(),
			client,
			extract: |body| body.get("price")?.as_str()?.parse().ok(),
		}),
	]
}

#[tokio::main]
async fn main() {
	telemetry::init_logging();

	let args = ArgsConfig::parse();
	let config = match load_config(&args) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Invalid configuration: {e}");
			std::process::exit(1);
		},
	};

	let credit = match CreditStore::open(&config.database_path) {
		Ok(store) => store,
		Err(e) => {
			eprintln!("Failed to open credit store at {:?}: {e}", config.database_path);
			std::process::exit(1);
		},
	};

	let catalog = match Catalog::load(credit.pool().clone()) {
		Ok(catalog) => Arc::new(catalog),
		Err(e) => {
			eprintln!("Failed to load model/provider catalog: {e}");
			std::process::exit(1);
		},
	};

	let bounded_http_client = service::build_bounded_http_client();
	let upstream_http_client = service::build_upstream_http_client();

	let mut seed = [0u8; 64];
	rand::thread_rng().fill(&mut seed[..]);
	let wallet: Arc<dyn wallet::WalletPrimitive> = Arc::new(CashuWallet::new(seed));

	let payment_methods = Arc::new(PaymentMethodRegistry::new(wallet.clone()));
	let price_oracle = PriceOracle::new();
	let refund_cache = Arc::new(RefundCache::with_ttl(config.refund_cache_ttl));
	let metrics = Arc::new(Metrics::new());

	let price_oracle_handle =
		price_oracle.clone().spawn(default_exchange_sources(bounded_http_client), config.price_refresh);

	let announce_handle = config.announcement_private_key.as_ref().map(|private_key_hex| {
		let spec = AnnouncementSpec {
			provider_id: config
				.upstream_provider_type
				.clone()
				.unwrap_or_else(|| "meterproxy".to_string()),
			endpoint_urls: vec![format!("http://{}/v1", config.listen_addr)],
			mint_urls: config.mint_urls.clone(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			metadata_json: None,
		};
		announce::spawn(private_key_hex.clone(), spec, config.relay_urls.clone(), config.announce_interval)
	});

	let state = AppState {
		credit,
		catalog,
		price_oracle,
		wallet,
		upstream_http_client,
		refund_cache,
		payment_methods,
		processing_fee_msat: config.processing_fee_msat,
		metrics,
		admin_password: config.admin_password.clone(),
	};

	let router = service::build_router(state);

	let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
		Ok(listener) => listener,
		Err(e) => {
			eprintln!("Failed to bind {}: {e}", config.listen_addr);
			std::process::exit(1);
		},
	};

	log::info!("listening on {}", config.listen_addr);

	if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await {
		log::error!("server error: {e}");
	}

	price_oracle_handle.abort();
	if let Some(handle) = announce_handle {
		handle.abort();
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.expect("failed to install CTRL-C handler");
	};

	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	tokio::select! {
		_ = ctrl_c => { log::info!("received CTRL-C, shutting down"); },
		_ = terminate => { log::info!("received SIGTERM, shutting down"); },
	}
}
