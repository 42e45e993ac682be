// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Cost model (spec §4.3): pre-request max-cost estimation and
//! post-response settlement.

use serde::Deserialize;

use crate::api::error::GatewayError;
use crate::catalog::Catalog;
use crate::price_oracle::PriceOracle;

const FALLBACK_PROMPT_UNITS: f64 = 1_000_000.0;
const FALLBACK_COMPLETION_UNITS: f64 = 32_000.0;
const FALLBACK_FEE_UNITS: f64 = 100_000.0;

const DEFAULT_MAX_COMPLETION_TOKENS: i64 = 4096;

fn ceil_msat(value: f64) -> i64 {
	value.ceil() as i64
}

/// Pre-request estimation (spec §4.3 "Pre-request").
pub(crate) fn estimate_max_cost(
	catalog: &Catalog, model_id: &str, max_completion_tokens: Option<i64>,
) -> Result<i64, GatewayError> {
	let model = catalog.model(model_id).ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))?;
	if let Some(precomputed) = model.max_cost_msat {
		return Ok(precomputed);
	}

	let provider = catalog
		.provider(&model.upstream_provider_id)
		.ok_or_else(|| GatewayError::Internal(format!("provider {} missing for model {}", model.upstream_provider_id, model_id)))?;

	let completion_budget = max_completion_tokens.unwrap_or(DEFAULT_MAX_COMPLETION_TOKENS) as f64;

	let (prompt_ceiling, completion_ceiling) = match (model.context_length, model.prompt_msat_per_token, model.completion_msat_per_token) {
		(Some(context_length), Some(prompt_price), Some(completion_price)) => {
			let prompt_tokens = (context_length as f64 - completion_budget).max(0.0);
			(prompt_tokens * prompt_price, completion_budget * completion_price)
		},
		(Some(context_length), prompt_price, completion_price) => {
			// No explicit completion budget on the descriptor: split
			// 80/20 between prompt and completion per spec step 3.
			let prompt_tokens = 0.8 * context_length as f64;
			let completion_tokens = 0.2 * context_length as f64;
			let prompt_price = prompt_price.unwrap_or(1.0);
			let completion_price = completion_price.unwrap_or(1.0);
			(prompt_tokens * prompt_price, completion_tokens * completion_price)
		},
		(None, _, _) => (FALLBACK_PROMPT_UNITS, FALLBACK_COMPLETION_UNITS + FALLBACK_FEE_UNITS),
	};

	let request_fee = model.request_fee_msat.unwrap_or(0) as f64;
	let total = (prompt_ceiling + completion_ceiling + request_fee) * provider.provider_fee_multiplier;
	Ok(ceil_msat(total).max(0))
}

/// Upstream `usage` object, shaped the way OpenAI-compatible and
/// Anthropic-compatible providers both report it.
#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct Usage {
	#[serde(default)]
	pub(crate) prompt_tokens: Option<i64>,
	#[serde(default)]
	pub(crate) completion_tokens: Option<i64>,
	#[serde(default)]
	pub(crate) cost: Option<f64>,
	#[serde(default)]
	pub(crate) cost_details: Option<CostDetails>,
	#[serde(default)]
	pub(crate) completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct CostDetails {
	#[serde(default)]
	pub(crate) upstream_inference_cost: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct CompletionTokensDetails {
	#[serde(default)]
	pub(crate) image_tokens: Option<i64>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SettlementOutcome {
	TokenBasedCost(i64),
	MaxCost,
	CostError,
}

/// Settlement (spec §4.3 "Settlement"). `max_cost_msat` is the reservation
/// this request holds; `usage` is `None` when the upstream body carried no
/// usage object at all (distinct from a present-but-empty object).
pub(crate) fn settle_cost(
	catalog: &Catalog, price_oracle: &PriceOracle, model_id: &str, usage: Option<&Usage>,
) -> SettlementOutcome {
	let Some(usage) = usage else {
		return SettlementOutcome::MaxCost;
	};

	// Step 1: an explicit fiat cost always wins over token counts.
	let explicit_usd = usage
		.cost_details
		.as_ref()
		.and_then(|d| d.upstream_inference_cost)
		.or(usage.cost);
	if let Some(usd) = explicit_usd {
		return match price_oracle.sat_per_fiat() {
			Some(sat_per_fiat) => {
				let msat = usd * sat_per_fiat * 1000.0;
				SettlementOutcome::TokenBasedCost(ceil_msat(msat).max(0))
			},
			None => {
				log::warn!("price oracle has no sample yet; falling back to token-based settlement for {model_id}");
				settle_from_tokens(catalog, model_id, usage)
			},
		};
	}

	settle_from_tokens(catalog, model_id, usage)
}

fn settle_from_tokens(catalog: &Catalog, model_id: &str, usage: &Usage) -> SettlementOutcome {
	let Some(model) = catalog.model(model_id) else {
		return SettlementOutcome::CostError;
	};

	match (model.prompt_msat_per_token, model.completion_msat_per_token) {
		(Some(prompt_price), Some(completion_price)) => {
			let prompt_msat = ceil_msat(usage.prompt_tokens.unwrap_or(0) as f64 * prompt_price);
			let completion_msat = ceil_msat(usage.completion_tokens.unwrap_or(0) as f64 * completion_price);
			let image_msat = match (model.completion_image_msat_per_token, image_tokens(usage)) {
				(Some(image_price), image_tokens) if image_tokens > 0 => {
					ceil_msat(image_tokens as f64 * image_price)
				},
				_ => 0,
			};
			SettlementOutcome::TokenBasedCost(prompt_msat + completion_msat + image_msat)
		},
		_ => {
			log::warn!("model {model_id} has no per-token pricing; settling at max cost");
			SettlementOutcome::MaxCost
		},
	}
}

fn image_tokens(usage: &Usage) -> i64 {
	usage.completion_tokens_details.as_ref().and_then(|d| d.image_tokens).unwrap_or(0)
}

/// Clips a settled cost to `[0, max_cost_msat]`, logging when upstream
/// overshoots its own declared ceiling.
pub(crate) fn clip_to_reservation(settled: i64, max_cost_msat: i64, model_id: &str) -> i64 {
	if settled > max_cost_msat {
		log::warn!(
			"settled cost {settled} msat exceeds reservation {max_cost_msat} msat for model {model_id}; clipping"
		);
		max_cost_msat
	} else {
		settled.max(0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clip_never_exceeds_reservation() {
		assert_eq!(clip_to_reservation(1_500, 1_000, "m"), 1_000);
		assert_eq!(clip_to_reservation(500, 1_000, "m"), 500);
		assert_eq!(clip_to_reservation(-5, 1_000, "m"), 0);
	}

	#[test]
	fn image_tokens_defaults_to_zero_without_details() {
		let usage = Usage { prompt_tokens: Some(10), completion_tokens: Some(5), ..Usage::default() };
		assert_eq!(image_tokens(&usage), 0);
	}

	#[test]
	fn image_tokens_reads_nested_detail() {
		let usage = Usage {
			completion_tokens_details: Some(CompletionTokensDetails { image_tokens: Some(7) }),
			..Usage::default()
		};
		assert_eq!(image_tokens(&usage), 7);
	}
}
