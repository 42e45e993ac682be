// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error kinds from spec §7. The variant carries whatever detail is safe to
/// hand back to the client; internal causes are logged, not serialized.
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum GatewayError {
	#[error("unauthorized")]
	Unauthorized,
	#[error("insufficient balance: {amount_required_msat} msat required for model {model}")]
	InsufficientBalance { amount_required_msat: u64, model: String },
	#[error("invalid token")]
	InvalidToken,
	#[error("payment already spent")]
	AlreadySpent,
	#[error("model not found: {0}")]
	ModelNotFound(String),
	#[error("pricing not found for model {0}")]
	PricingNotFound(String),
	#[error("upstream transport error: {0}")]
	UpstreamTransport(String),
	#[error("wallet/mint unavailable: {0}")]
	PaymentServiceUnavailable(String),
	#[error("refund blocked: reservation in flight")]
	RefundBlocked,
	#[error("balance too small to refund")]
	BalanceTooSmall,
	#[error("payment method not implemented")]
	NotImplemented,
	#[error("internal error: {0}")]
	Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
	reason: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	amount_required_msat: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	model: Option<String>,
}

impl GatewayError {
	pub(crate) fn status_code(&self) -> StatusCode {
		match self {
			GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
			GatewayError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
			GatewayError::InvalidToken => StatusCode::BAD_REQUEST,
			GatewayError::AlreadySpent => StatusCode::BAD_REQUEST,
			GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
			GatewayError::PricingNotFound(_) => StatusCode::NOT_FOUND,
			GatewayError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
			GatewayError::PaymentServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			GatewayError::RefundBlocked => StatusCode::CONFLICT,
			GatewayError::BalanceTooSmall => StatusCode::BAD_REQUEST,
			GatewayError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		let body = match &self {
			GatewayError::InsufficientBalance { amount_required_msat, model } => ErrorBody {
				reason: "Insufficient balance".to_string(),
				amount_required_msat: Some(*amount_required_msat),
				model: Some(model.clone()),
			},
			other => ErrorBody {
				reason: other.to_string(),
				amount_required_msat: None,
				model: None,
			},
		};
		(status, Json(body)).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Insufficient balance returns 402 with the exact body shape the
	/// client relies on to retry with a bigger top-up.
	#[test]
	fn insufficient_balance_maps_to_402_with_amount_and_model() {
		let err = GatewayError::InsufficientBalance { amount_required_msat: 200, model: "m".to_string() };
		assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);

		let body = ErrorBody {
			reason: "Insufficient balance".to_string(),
			amount_required_msat: Some(200),
			model: Some("m".to_string()),
		};
		let value = serde_json::to_value(&body).unwrap();
		assert_eq!(value["reason"], "Insufficient balance");
		assert_eq!(value["amount_required_msat"], 200);
		assert_eq!(value["model"], "m");
	}

	#[test]
	fn upstream_transport_error_maps_to_bad_gateway_without_extra_fields() {
		let err = GatewayError::UpstreamTransport("oops".to_string());
		assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

		let body = ErrorBody { reason: err.to_string(), amount_required_msat: None, model: None };
		let value = serde_json::to_value(&body).unwrap();
		assert!(value.get("amount_required_msat").is_none());
		assert!(value.get("model").is_none());
	}
}
