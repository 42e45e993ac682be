// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The admin-gated catalog write surface (spec §10.3): `POST` routes that
//! upsert a model or provider row, checked against `METERPROXY_ADMIN_PASSWORD`
//! rather than the `Authorization` bearer the rest of the API uses — an
//! admin credential is an operator secret, not a metered credential.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::api::error::GatewayError;
use crate::catalog::{self, ModelDescriptor, ProviderDescriptor};
use crate::service::AppState;

fn require_admin(admin_password: Option<&str>, headers: &HeaderMap) -> Result<(), GatewayError> {
	let configured = admin_password.ok_or(GatewayError::Unauthorized)?;
	let supplied = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	match supplied {
		Some(supplied) if supplied == configured => Ok(()),
		_ => Err(GatewayError::Unauthorized),
	}
}

#[derive(Deserialize)]
pub(crate) struct UpsertModelRequest {
	id: String,
	upstream_provider_id: String,
	#[serde(default)]
	context_length: Option<i64>,
	#[serde(default)]
	prompt_msat_per_token: Option<f64>,
	#[serde(default)]
	completion_msat_per_token: Option<f64>,
	#[serde(default)]
	completion_image_msat_per_token: Option<f64>,
	#[serde(default)]
	request_fee_msat: Option<i64>,
	#[serde(default)]
	max_cost_msat: Option<i64>,
}

/// `POST /v1/admin/models` (spec §10.3).
pub(crate) async fn handle_upsert_model(
	State(state): State<AppState>, headers: HeaderMap, Json(request): Json<UpsertModelRequest>,
) -> Response {
	if let Err(e) = require_admin(state.admin_password.as_deref(), &headers) {
		return e.into_response();
	}

	let model = ModelDescriptor {
		id: request.id,
		upstream_provider_id: request.upstream_provider_id,
		context_length: request.context_length,
		prompt_msat_per_token: request.prompt_msat_per_token,
		completion_msat_per_token: request.completion_msat_per_token,
		completion_image_msat_per_token: request.completion_image_msat_per_token,
		request_fee_msat: request.request_fee_msat,
		max_cost_msat: request.max_cost_msat,
	};

	if let Err(e) = catalog::upsert_model(state.credit.pool(), &model) {
		return GatewayError::Internal(e.to_string()).into_response();
	}
	state.catalog.invalidate();
	axum::http::StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
pub(crate) struct UpsertProviderRequest {
	id: String,
	provider_type: String,
	base_url: String,
	api_key: String,
	#[serde(default = "default_fee_multiplier")]
	provider_fee_multiplier: f64,
}

fn default_fee_multiplier() -> f64 {
	1.0
}

/// `POST /v1/admin/providers` (spec §10.3).
pub(crate) async fn handle_upsert_provider(
	State(state): State<AppState>, headers: HeaderMap, Json(request): Json<UpsertProviderRequest>,
) -> Response {
	if let Err(e) = require_admin(state.admin_password.as_deref(), &headers) {
		return e.into_response();
	}

	let provider = ProviderDescriptor {
		id: request.id,
		provider_type: request.provider_type,
		base_url: request.base_url,
		api_key: request.api_key,
		provider_fee_multiplier: request.provider_fee_multiplier,
	};

	if let Err(e) = catalog::upsert_provider(state.credit.pool(), &provider) {
		return GatewayError::Internal(e.to_string()).into_response();
	}
	state.catalog.invalidate();
	axum::http::StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with_bearer(value: &str) -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(axum::http::header::AUTHORIZATION, format!("Bearer {value}").parse().unwrap());
		headers
	}

	#[test]
	fn require_admin_rejects_when_unconfigured() {
		let headers = headers_with_bearer("whatever");
		assert!(matches!(require_admin(None, &headers), Err(GatewayError::Unauthorized)));
	}

	#[test]
	fn require_admin_rejects_wrong_password() {
		let headers = headers_with_bearer("wrong");
		assert!(matches!(require_admin(Some("correct-horse"), &headers), Err(GatewayError::Unauthorized)));
	}

	#[test]
	fn require_admin_accepts_matching_password() {
		let headers = headers_with_bearer("correct-horse");
		assert!(require_admin(Some("correct-horse"), &headers).is_ok());
	}
}
