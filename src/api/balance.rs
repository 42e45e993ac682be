// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Balance management surface (spec §6): `info` / `create` / `topup` /
//! `refund`. Unlike the proxy surface these handlers never reserve or
//! forward anything; they only move `balance_msat` around.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::GatewayError;
use crate::auth::{self, AuthOptions, API_KEY_PREFIX};
use crate::refund;
use crate::service::AppState;

fn bearer_from(headers: &HeaderMap) -> Result<&str, GatewayError> {
	headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.filter(|b| !b.is_empty())
		.ok_or(GatewayError::Unauthorized)
}

fn refund_options<'a>(headers: &'a HeaderMap) -> AuthOptions<'a> {
	AuthOptions {
		refund_address: headers.get("x-refund-address").and_then(|v| v.to_str().ok()),
		refund_expiration: headers
			.get("x-refund-expiration")
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse().ok()),
		parent_fingerprint: None,
	}
}

#[derive(Serialize)]
struct BalanceInfo {
	api_key: String,
	balance: i64,
	reserved: i64,
}

/// `GET /v1/balance/info` (spec §6).
pub(crate) async fn handle_info(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let now = chrono::Utc::now().timestamp();
	let bearer = match bearer_from(&headers) {
		Ok(bearer) => bearer,
		Err(e) => return e.into_response(),
	};
	let credential = match auth::authenticate(&state.credit, state.wallet.as_ref(), Some(&format!("Bearer {bearer}")), AuthOptions::default(), now).await {
		Ok(credential) => credential,
		Err(e) => return e.into_response(),
	};

	Json(BalanceInfo {
		api_key: format!("{API_KEY_PREFIX}{}", credential.fingerprint),
		balance: credential.balance_msat,
		reserved: credential.reserved_msat,
	})
	.into_response()
}

#[derive(Deserialize)]
pub(crate) struct CreateQuery {
	initial_balance_token: String,
	/// Child-key lineage (§11): scopes the new credential to an
	/// existing wallet's fingerprint without sharing its balance.
	#[serde(default)]
	parent_fingerprint: Option<String>,
}

/// `GET /v1/balance/create?initial_balance_token=…` (spec §6). The token is
/// always an ecash bearer — a fresh credential has no API key yet to carry
/// one in the `Authorization` header — so this always goes through the
/// ecash-redemption branch of the authenticator, never the API-key branch.
pub(crate) async fn handle_create(
	State(state): State<AppState>, headers: HeaderMap, Query(query): Query<CreateQuery>,
) -> Response {
	let now = chrono::Utc::now().timestamp();
	let mut options = refund_options(&headers);
	options.parent_fingerprint = query.parent_fingerprint.as_deref();
	let credential = match auth::authenticate_ecash_bearer(
		&state.credit,
		state.wallet.as_ref(),
		&query.initial_balance_token,
		options,
		now,
	)
	.await
	{
		Ok(credential) => credential,
		Err(e) => return e.into_response(),
	};

	Json(BalanceInfo {
		api_key: format!("{API_KEY_PREFIX}{}", credential.fingerprint),
		balance: credential.balance_msat,
		reserved: credential.reserved_msat,
	})
	.into_response()
}

#[derive(Deserialize)]
pub(crate) struct TopupRequest {
	#[serde(default)]
	payment_data: Option<String>,
	#[serde(default)]
	payment_method: Option<String>,
	/// Legacy alias for `payment_data` accepted alongside it (spec §6:
	/// "or legacy `{cashu_token}`").
	#[serde(default)]
	cashu_token: Option<String>,
}

#[derive(Serialize)]
struct TopupResponse {
	msats: i64,
}

/// `POST /v1/balance/topup` (spec §6). The `Authorization` header identifies
/// the credential being credited; the request body carries the payment
/// instrument being redeemed into it, which is a distinct bearer value.
pub(crate) async fn handle_topup(
	State(state): State<AppState>, headers: HeaderMap, Json(request): Json<TopupRequest>,
) -> Response {
	let now = chrono::Utc::now().timestamp();
	let bearer = match bearer_from(&headers) {
		Ok(bearer) => bearer,
		Err(e) => return e.into_response(),
	};
	let credential = match auth::authenticate(&state.credit, state.wallet.as_ref(), Some(&format!("Bearer {bearer}")), AuthOptions::default(), now).await {
		Ok(credential) => credential,
		Err(e) => return e.into_response(),
	};

	let payment_data = request.payment_data.or(request.cashu_token);
	let Some(payment_data) = payment_data else {
		return GatewayError::InvalidToken.into_response();
	};
	let _ = request.payment_method;

	let method = match state.payment_methods.detect(&payment_data) {
		Some(method) => method,
		None => return GatewayError::InvalidToken.into_response(),
	};

	let (amount_msat, _unit, _mint) = match method.redeem(&payment_data).await {
		Ok(redeemed) => redeemed,
		Err(crate::wallet::WalletError::AlreadySpent) => return GatewayError::AlreadySpent.into_response(),
		Err(crate::wallet::WalletError::Invalid) => return GatewayError::InvalidToken.into_response(),
		Err(crate::wallet::WalletError::MintError(msg)) if msg == "not_implemented" => {
			return GatewayError::NotImplemented.into_response();
		},
		Err(crate::wallet::WalletError::MintError(msg)) => {
			return GatewayError::PaymentServiceUnavailable(msg).into_response();
		},
	};

	if let Err(e) = state.credit.credit(&credential.fingerprint, amount_msat) {
		return GatewayError::Internal(e.to_string()).into_response();
	}

	Json(TopupResponse { msats: amount_msat }).into_response()
}

#[derive(Serialize)]
#[serde(untagged)]
enum RefundResponse {
	Token { token: String },
	Recipient { recipient: String },
}

/// `POST /v1/balance/refund` (spec §4.5, §6).
pub(crate) async fn handle_refund(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let bearer = match bearer_from(&headers) {
		Ok(bearer) => bearer,
		Err(e) => return e.into_response(),
	};

	match refund::refund(&state.credit, state.wallet.as_ref(), &state.refund_cache, bearer).await {
		Ok(refund::PayoutArtifact::Token(token)) => Json(RefundResponse::Token { token }).into_response(),
		Ok(refund::PayoutArtifact::Recipient(recipient)) => {
			Json(RefundResponse::Recipient { recipient }).into_response()
		},
		Err(e) => e.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bearer_from_strips_bearer_prefix() {
		let mut headers = HeaderMap::new();
		headers.insert(axum::http::header::AUTHORIZATION, "Bearer sk-abc123".parse().unwrap());
		assert_eq!(bearer_from(&headers).unwrap(), "sk-abc123");
	}

	#[test]
	fn bearer_from_rejects_missing_header() {
		let headers = HeaderMap::new();
		assert!(bearer_from(&headers).is_err());
	}

	#[test]
	fn refund_options_reads_refund_headers() {
		let mut headers = HeaderMap::new();
		headers.insert("x-refund-address", "lnurl1abc".parse().unwrap());
		headers.insert("x-refund-expiration", "1700000000".parse().unwrap());
		let options = refund_options(&headers);
		assert_eq!(options.refund_address, Some("lnurl1abc"));
		assert_eq!(options.refund_expiration, Some(1_700_000_000));
	}
}
