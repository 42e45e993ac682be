// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The ephemeral-bearer path (spec §4.8): credit redeemed per request via
//! `X-Cashu`, refund minted inline and returned in a response header. Unlike
//! the persistent-credential path this never touches the credit store —
//! the entire lifecycle lives in the scope of one request.

use axum::http::HeaderValue;
use bytes::Bytes;

use crate::api::error::GatewayError;
use crate::api::sse::SseUsageTee;
use crate::cost::{self, SettlementOutcome, Usage};
use crate::wallet::{Unit, WalletPrimitive};

/// Deducted from every ephemeral refund so a malformed upstream can't be
/// used to launder free usage by returning unparseable bodies (spec §4.8:
/// "the processing fee constant prevents free usage via intentionally
/// malformed upstreams"). Configurable via `METERPROXY_PROCESSING_FEE_MSAT`;
/// this is the default used when that variable is unset.
pub(crate) const DEFAULT_PROCESSING_FEE_MSAT: i64 = 1_000;

pub(crate) struct RedeemedEphemeral {
	pub(crate) amount_msat: i64,
	pub(crate) unit: Unit,
	pub(crate) mint: String,
}

/// Step 1: redeem the entire token up front.
pub(crate) async fn redeem(wallet: &dyn WalletPrimitive, bearer: &str) -> Result<RedeemedEphemeral, GatewayError> {
	let redeemed = wallet.receive(bearer).await.map_err(|err| match err {
		crate::wallet::WalletError::AlreadySpent => GatewayError::AlreadySpent,
		crate::wallet::WalletError::Invalid => GatewayError::InvalidToken,
		crate::wallet::WalletError::MintError(msg) => GatewayError::PaymentServiceUnavailable(msg),
	})?;
	Ok(RedeemedEphemeral { amount_msat: redeemed.amount_msat, unit: redeemed.unit, mint: redeemed.mint })
}

/// Mints a new bearer for `amount_msat` (already net of any fee the caller
/// wants deducted) and renders it as an `X-Cashu` header value. Returns
/// `None` silently if the remainder rounds to zero in the bearer's native
/// unit — there is nothing worth minting and the caller should omit the
/// header entirely rather than fail the response.
pub(crate) async fn mint_refund_header(
	wallet: &dyn WalletPrimitive, amount_msat: i64, unit: Unit, mint: &str,
) -> Result<Option<HeaderValue>, GatewayError> {
	if unit.from_msat(amount_msat.max(0)) <= 0 {
		return Ok(None);
	}
	let token = wallet.send(amount_msat.max(0), unit, mint).await.map_err(|err| match err {
		crate::wallet::WalletError::AlreadySpent => GatewayError::AlreadySpent,
		crate::wallet::WalletError::Invalid => GatewayError::InvalidToken,
		crate::wallet::WalletError::MintError(msg) => GatewayError::PaymentServiceUnavailable(msg),
	})?;
	HeaderValue::from_str(&token).map(Some).map_err(|e| GatewayError::Internal(format!("refund token not a valid header value: {e}")))
}

/// Step 3: upstream failure emergency refund, `A − fee`.
pub(crate) async fn refund_on_upstream_failure(
	wallet: &dyn WalletPrimitive, redeemed: &RedeemedEphemeral, processing_fee_msat: i64,
) -> Result<Option<HeaderValue>, GatewayError> {
	let remainder = redeemed.amount_msat - processing_fee_msat;
	mint_refund_header(wallet, remainder, redeemed.unit, &redeemed.mint).await
}

/// Step 4: success path. Parses `body` for `usage` (whether a plain JSON
/// object or SSE-framed text), settles the actual cost against the
/// redeemed amount `A`, and mints the refund of the remainder. Buffers
/// always, per spec: the refund token must land in a response header,
/// which precedes the body on the wire, so incremental delivery is not
/// possible on this path even when upstream streamed. The result is
/// clipped to `[0, redeemed_amount_msat]`; when no usable usage is found
/// this charges only the processing fee, so the caller's refund still
/// comes out to `A - fee` rather than `fee` — a malformed or usage-less
/// upstream body should cost the requester the same small fee as the
/// explicit upstream-failure path, not nearly their whole balance.
pub(crate) fn settle_buffered(
	catalog: &crate::catalog::Catalog, price_oracle: &crate::price_oracle::PriceOracle, model_id: &str,
	redeemed_amount_msat: i64, body: &Bytes, is_event_stream: bool, processing_fee_msat: i64,
) -> i64 {
	let usage = if is_event_stream { extract_usage_from_sse_body(body) } else { extract_usage_from_json_body(body) };

	let settled = match cost::settle_cost(catalog, price_oracle, model_id, usage.as_ref()) {
		SettlementOutcome::TokenBasedCost(amount) => amount,
		SettlementOutcome::MaxCost | SettlementOutcome::CostError => {
			log::warn!("ephemeral path: no usable usage for model {model_id}, charging only the processing fee");
			processing_fee_msat
		},
	};
	cost::clip_to_reservation(settled, redeemed_amount_msat, model_id)
}

fn extract_usage_from_json_body(body: &Bytes) -> Option<Usage> {
	let parsed: serde_json::Value = serde_json::from_slice(body).ok()?;
	let usage_value = parsed.get("usage")?.clone();
	serde_json::from_value(usage_value).ok()
}

fn extract_usage_from_sse_body(body: &Bytes) -> Option<Usage> {
	let mut tee = SseUsageTee::new();
	tee.feed(body);
	tee.finish()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::{Redeemed, WalletError};

	struct StubWallet {
		send_amounts: std::sync::Mutex<Vec<i64>>,
	}

	impl StubWallet {
		fn new() -> Self {
			Self { send_amounts: std::sync::Mutex::new(Vec::new()) }
		}
	}

	#[async_trait::async_trait]
	impl WalletPrimitive for StubWallet {
		async fn receive(&self, _token: &str) -> Result<Redeemed, WalletError> {
			Ok(Redeemed { amount_msat: 10_000, unit: Unit::Msat, mint: "https://mint.example".to_string() })
		}
		async fn send(&self, amount: i64, _unit: Unit, _mint: &str) -> Result<String, WalletError> {
			self.send_amounts.lock().unwrap().push(amount);
			Ok(format!("cashuB{amount}"))
		}
		async fn send_to_address(
			&self, _amount: i64, _unit: Unit, _mint: &str, _address: &str,
		) -> Result<(), WalletError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn refund_on_upstream_failure_deducts_processing_fee() {
		let wallet = StubWallet::new();
		let redeemed = RedeemedEphemeral { amount_msat: 10_000, unit: Unit::Msat, mint: "https://mint.example".to_string() };
		let header = refund_on_upstream_failure(&wallet, &redeemed, DEFAULT_PROCESSING_FEE_MSAT).await.unwrap().unwrap();
		assert_eq!(header.to_str().unwrap(), "cashuB9000");
	}

	/// A 5000 msat ephemeral token against a 1200 msat settled cost mints a
	/// 3800 msat refund header.
	#[tokio::test]
	async fn ephemeral_settlement_mints_remainder_of_redeemed_amount() {
		let wallet = StubWallet::new();
		let redeemed_amount_msat = 5_000;
		let settled = cost::clip_to_reservation(1_200, redeemed_amount_msat, "m");
		let remainder = redeemed_amount_msat - settled;

		let header = mint_refund_header(&wallet, remainder, Unit::Msat, "https://mint.example").await.unwrap().unwrap();
		assert_eq!(header.to_str().unwrap(), "cashuB3800");
	}

	/// A malformed/usage-less body falls back to charging only the
	/// processing fee, not `redeemed - fee`: with A=10,000 and fee=1,000 the
	/// requester should get back 9,000, the same as the explicit
	/// upstream-failure path, not 1,000.
	#[test]
	fn settle_buffered_without_usage_charges_only_the_processing_fee() {
		let dir = tempfile::tempdir().unwrap();
		let store = crate::credit::CreditStore::open(&dir.path().join("ephemeral_test.sqlite3")).unwrap();
		let catalog = crate::catalog::Catalog::load(store.pool().clone()).unwrap();
		let price_oracle = crate::price_oracle::PriceOracle::new();
		let body = Bytes::from_static(b"not json at all");

		let charged = settle_buffered(&catalog, &price_oracle, "unknown-model", 10_000, &body, false, 1_000);
		assert_eq!(charged, 1_000);

		let refund = 10_000 - charged;
		assert_eq!(refund, 9_000);
	}

	#[tokio::test]
	async fn mint_refund_header_omits_header_for_dust_remainder() {
		let wallet = StubWallet::new();
		let header = mint_refund_header(&wallet, 0, Unit::Sat, "https://mint.example").await.unwrap();
		assert!(header.is_none());
	}

	#[test]
	fn extract_usage_from_json_body_reads_nested_usage() {
		let body = Bytes::from_static(br#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#);
		let usage = extract_usage_from_json_body(&body).unwrap();
		assert_eq!(usage.prompt_tokens, Some(3));
	}

	#[test]
	fn extract_usage_from_sse_body_reads_last_event() {
		let body = Bytes::from_static(
			b"data: {\"choices\":[]}\n\ndata: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\n\ndata: [DONE]\n\n",
		);
		let usage = extract_usage_from_sse_body(&body).unwrap();
		assert_eq!(usage.completion_tokens, Some(2));
	}
}
