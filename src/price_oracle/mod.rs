// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The price oracle (spec §4.2): an independent periodic task that keeps a
//! process-wide last-known-good sat-per-fiat rate, read lock-free by the
//! request path (spec §5: "a word-sized atomic load/store suffices").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

const SATS_PER_BTC: f64 = 100_000_000.0;
const REFRESH_JITTER_FRACTION: f64 = 0.10;

/// Bit pattern for "no sample yet"; real sat-per-fiat rates are always
/// positive finite f64s so this can never collide.
const NO_SAMPLE: u64 = u64::MAX;

#[derive(Clone)]
pub(crate) struct PriceOracle {
	last_known_good: Arc<AtomicU64>,
}

#[async_trait::async_trait]
pub(crate) trait ExchangeSource: Send + Sync {
	/// Returns fiat-per-BTC (e.g. USD/BTC) from one exchange.
	async fn fetch_fiat_per_btc(&self) -> Result<f64, String>;
}

pub(crate) struct HttpExchangeSource {
	pub(crate) name: &'static str,
	pub(crate) url: String,
	pub(crate) client: reqwest::Client,
	/// Extracts fiat-per-BTC from the parsed JSON body.
	pub(crate) extract: fn(&serde_json::Value) -> Option<f64>,
}

#[async_trait::async_trait]
impl ExchangeSource for HttpExchangeSource {
	async fn fetch_fiat_per_btc(&self) -> Result<f64, String> {
		let resp = self
			.client
			.get(&self.url)
			.timeout(Duration::from_secs(10))
			.send()
			.await
			.map_err(|e| format!("{} request failed: {e}", self.name))?;
		let body: serde_json::Value =
			resp.json().await.map_err(|e| format!("{} returned invalid JSON: {e}", self.name))?;
		(self.extract)(&body).ok_or_else(|| format!("{} response missing expected field", self.name))
	}
}

impl PriceOracle {
	pub(crate) fn new() -> Self {
		Self { last_known_good: Arc::new(AtomicU64::new(NO_SAMPLE)) }
	}

	/// Last-known-good sat-per-fiat rate, or `None` if no sample has ever
	/// landed.
	pub(crate) fn sat_per_fiat(&self) -> Option<f64> {
		let bits = self.last_known_good.load(Ordering::Relaxed);
		if bits == NO_SAMPLE {
			None
		} else {
			Some(f64::from_bits(bits))
		}
	}

	fn publish(&self, sat_per_fiat: f64) {
		self.last_known_good.store(sat_per_fiat.to_bits(), Ordering::Relaxed);
	}

	/// Runs one refresh cycle: query all sources in parallel, take the
	/// minimum of successful responses (conservative lower bound for
	/// selling BTC), convert to sat-per-fiat. Never panics, never blocks a
	/// request: failures are logged and the previous value retained.
	pub(crate) async fn refresh_once(&self, sources: &[Arc<dyn ExchangeSource>]) {
		let results = futures_util::future::join_all(sources.iter().map(|s| s.fetch_fiat_per_btc())).await;

		let mut successes = Vec::new();
		for result in results {
			match result {
				Ok(fiat_per_btc) if fiat_per_btc.is_finite() && fiat_per_btc > 0.0 => {
					successes.push(fiat_per_btc)
				},
				Ok(_) => log::warn!("price oracle: exchange returned a non-finite/non-positive rate"),
				Err(e) => log::warn!("price oracle: exchange query failed: {e}"),
			}
		}

		if successes.is_empty() {
			log::warn!("price oracle: all exchange sources failed this cycle; retaining last-known-good value");
			return;
		}

		let min_fiat_per_btc = successes.into_iter().fold(f64::INFINITY, f64::min);
		// sat-per-fiat = (sats per BTC) / (fiat per BTC).
		self.publish(SATS_PER_BTC / min_fiat_per_btc);
	}

	/// Spawns the background refresh loop. Returns the `JoinHandle` so the
	/// caller can hold it for graceful shutdown bookkeeping.
	pub(crate) fn spawn(
		self, sources: Vec<Arc<dyn ExchangeSource>>, refresh_interval: Duration,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				self.refresh_once(&sources).await;
				let jitter = 1.0
					+ rand::thread_rng().gen_range(-REFRESH_JITTER_FRACTION..=REFRESH_JITTER_FRACTION);
				let sleep_for = refresh_interval.mul_f64(jitter.max(0.01));
				tokio::time::sleep(sleep_for).await;
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FixedSource(Result<f64, String>);

	#[async_trait::async_trait]
	impl ExchangeSource for FixedSource {
		async fn fetch_fiat_per_btc(&self) -> Result<f64, String> {
			self.0.clone()
		}
	}

	#[tokio::test]
	async fn takes_minimum_of_successful_sources() {
		let oracle = PriceOracle::new();
		let sources: Vec<Arc<dyn ExchangeSource>> = vec![
			Arc::new(FixedSource(Ok(60_000.0))),
			Arc::new(FixedSource(Ok(59_000.0))),
			Arc::new(FixedSource(Err("timeout".to_string()))),
		];
		oracle.refresh_once(&sources).await;
		let sat_per_fiat = oracle.sat_per_fiat().unwrap();
		assert!((sat_per_fiat - SATS_PER_BTC / 59_000.0).abs() < 1e-6);
	}

	#[tokio::test]
	async fn all_sources_failing_retains_previous_value() {
		let oracle = PriceOracle::new();
		oracle.publish(1234.5);
		let sources: Vec<Arc<dyn ExchangeSource>> =
			vec![Arc::new(FixedSource(Err("down".to_string())))];
		oracle.refresh_once(&sources).await;
		assert_eq!(oracle.sat_per_fiat(), Some(1234.5));
	}

	#[test]
	fn no_sample_reads_as_none() {
		let oracle = PriceOracle::new();
		assert_eq!(oracle.sat_per_fiat(), None);
	}
}
