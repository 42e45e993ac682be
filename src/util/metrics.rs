// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A small in-process gauge set (§10.2) for operational
//! visibility, without pulling in the full admin/analytics surface that
//! stays out of scope. Exposed read-only; nothing in the request path ever
//! reads these back to make a decision.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::price_oracle::PriceOracle;

/// A [`Metrics`] value that can go up and down.
pub(crate) struct IntGauge {
	inner: AtomicI64,
}

impl IntGauge {
	fn new() -> Self {
		Self { inner: AtomicI64::new(0) }
	}

	fn add(&self, delta: i64) {
		self.inner.fetch_add(delta, Ordering::Relaxed);
	}

	fn get(&self) -> i64 {
		self.inner.load(Ordering::Relaxed)
	}
}

struct MetricsOutput {
	name: &'static str,
	help_text: &'static str,
	metric_type: &'static str,
	value: String,
}

impl MetricsOutput {
	fn new(name: &'static str, help_text: &'static str, metric_type: &'static str, value: String) -> Self {
		Self { name, help_text, metric_type, value }
	}
}

/// Process-lifetime counters over the two seams worth observing externally:
/// the reservation lifecycle (§4.7) and price staleness (§4.2).
pub(crate) struct Metrics {
	active_reservations: IntGauge,
	total_settled_msat: IntGauge,
}

impl Metrics {
	pub(crate) fn new() -> Self {
		Self { active_reservations: IntGauge::new(), total_settled_msat: IntGauge::new() }
	}

	/// Reservation opened (spec §4.7 `ESTIMATED` -> reserve succeeds).
	pub(crate) fn reservation_opened(&self) {
		self.active_reservations.add(1);
	}

	/// Reservation closed, whether by settle or release (spec §4.7
	/// `RELEASED`).
	pub(crate) fn reservation_closed(&self) {
		self.active_reservations.add(-1);
	}

	/// Records a completed settlement's actual cost (spec §4.7 `SETTLE`).
	pub(crate) fn record_settlement(&self, amount_msat: i64) {
		self.total_settled_msat.add(amount_msat);
	}

	fn format_metrics_output(&self, buffer: &mut String, output: &MetricsOutput) {
		buffer.push_str(&format!("# HELP {} {}\n", output.name, output.help_text));
		buffer.push_str(&format!("# TYPE {} {}\n", output.name, output.metric_type));
		buffer.push_str(&format!("{} {}\n", output.name, output.value));
	}

	/// Renders the gauge set as Prometheus exposition text. `price_oracle`
	/// is read at render time rather than cached, since staleness is a
	/// property of "is there a sample right now", not an event to count.
	pub(crate) fn gather_metrics(&self, price_oracle: &PriceOracle) -> String {
		let mut buffer = String::new();

		self.format_metrics_output(
			&mut buffer,
			&MetricsOutput::new(
				"meterproxy_active_reservations",
				"Reservations currently open against the credit store",
				"gauge",
				self.active_reservations.get().to_string(),
			),
		);
		self.format_metrics_output(
			&mut buffer,
			&MetricsOutput::new(
				"meterproxy_total_settled_msat",
				"Cumulative settled cost across all requests, in millisatoshis",
				"counter",
				self.total_settled_msat.get().to_string(),
			),
		);
		self.format_metrics_output(
			&mut buffer,
			&MetricsOutput::new(
				"meterproxy_price_stale",
				"1 if the price oracle has no last-known-good sample yet, 0 otherwise",
				"gauge",
				if price_oracle.sat_per_fiat().is_none() { "1" } else { "0" }.to_string(),
			),
		);

		buffer
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn active_reservations_tracks_open_and_close() {
		let metrics = Metrics::new();
		metrics.reservation_opened();
		metrics.reservation_opened();
		metrics.reservation_closed();
		assert_eq!(metrics.active_reservations.get(), 1);
	}

	#[test]
	fn record_settlement_accumulates() {
		let metrics = Metrics::new();
		metrics.record_settlement(100);
		metrics.record_settlement(250);
		assert_eq!(metrics.total_settled_msat.get(), 350);
	}

	#[test]
	fn gather_metrics_reflects_price_staleness() {
		let metrics = Metrics::new();
		let oracle = PriceOracle::new();
		let output = metrics.gather_metrics(&oracle);
		assert!(output.contains("meterproxy_price_stale 1"));
	}
}
