// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The proxy engine (spec §4.7): the request state machine. `ARRIVED` to
//! `ESTIMATED` to `FORWARDING` to `{BUFFERED,STREAMING}` to `SETTLE` to
//! `RELEASED`, with a guaranteed-release guard covering every exit path.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::api::error::GatewayError;
use crate::api::sse::SseUsageTee;
use crate::auth::{self, AuthOptions};
use crate::cost::{self, SettlementOutcome};
use crate::credit::ReserveOutcome;
use crate::ephemeral;
use crate::router;
use crate::service::AppState;

/// Headers dropped from the upstream response before relaying it to the
/// client (spec §6: "upstream headers pass through except hop-by-hop").
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length", "keep-alive"];

pub(crate) async fn handle_proxy(
	State(state): State<AppState>, Path(path): Path<String>, method: Method, headers: HeaderMap, body: Bytes,
) -> Response {
	let now = chrono::Utc::now().timestamp();

	if let Some(cashu) = headers.get("x-cashu").and_then(|v| v.to_str().ok()).map(str::to_string) {
		return handle_ephemeral(state, path, method, headers, body, cashu).await;
	}

	let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
	let credential = match auth::authenticate(&state.credit, state.wallet.as_ref(), auth_header, AuthOptions::default(), now).await {
		Ok(credential) => credential,
		Err(e) => return e.into_response(),
	};

	let model_id = match extract_model_id(&method, &path, &body) {
		Ok(model_id) => model_id,
		Err(e) => return e.into_response(),
	};
	let max_completion_tokens = extract_max_completion_tokens(&body);

	let max_cost_msat = match cost::estimate_max_cost(&state.catalog, &model_id, max_completion_tokens) {
		Ok(amount) => amount,
		Err(e) => return e.into_response(),
	};

	match state.credit.reserve(&credential.fingerprint, max_cost_msat) {
		Ok(ReserveOutcome::Insufficient) => {
			return GatewayError::InsufficientBalance { amount_required_msat: max_cost_msat as u64, model: model_id }
				.into_response();
		},
		Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
		Ok(ReserveOutcome::Ok) => state.metrics.reservation_opened(),
	}

	let target = match router::resolve(&state.catalog, &model_id, &path) {
		Ok(target) => target,
		Err(e) => {
			release(&state, &credential.fingerprint, max_cost_msat);
			return e.into_response();
		},
	};

	let outbound_headers = router::rewrite_headers(&headers, &target.provider.api_key);
	let upstream = state
		.upstream_http_client
		.request(router::to_reqwest_method(&method), &target.url)
		.headers(outbound_headers)
		.body(body)
		.send()
		.await;

	let upstream_response = match upstream {
		Ok(resp) => resp,
		Err(e) => {
			release(&state, &credential.fingerprint, max_cost_msat);
			log::warn!("proxy: upstream transport error forwarding to {}: {e}", target.url);
			return GatewayError::UpstreamTransport(e.to_string()).into_response();
		},
	};

	if !upstream_response.status().is_success() {
		release(&state, &credential.fingerprint, max_cost_msat);
		return pass_through_error(upstream_response).await;
	}

	if is_event_stream(upstream_response.headers()) {
		stream_and_settle(state, credential.fingerprint, model_id, max_cost_msat, upstream_response)
	} else {
		buffer_and_settle(state, credential.fingerprint, model_id, max_cost_msat, upstream_response).await
	}
}

fn release(state: &AppState, fingerprint: &str, max_cost_msat: i64) {
	if let Err(e) = state.credit.release(fingerprint, max_cost_msat) {
		log::error!("proxy: failed to release reservation for {fingerprint}: {e}");
	}
	state.metrics.reservation_closed();
}

async fn pass_through_error(upstream_response: reqwest::Response) -> Response {
	let status = upstream_response.status();
	let headers = relay_headers(upstream_response.headers());
	let body = upstream_response.bytes().await.unwrap_or_default();
	let mut response = Response::builder().status(status);
	for (name, value) in headers.iter() {
		response = response.header(name, value);
	}
	response.body(Body::from(body)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn relay_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in upstream.iter() {
		if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
			continue;
		}
		if let (Ok(name), Ok(value)) =
			(HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes()))
		{
			out.insert(name, value);
		}
	}
	out
}

fn is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
	headers
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|ct| ct.contains("text/event-stream"))
		.unwrap_or(false)
}

/// BUFFERED (spec §4.7): read the whole body, settle, relay.
async fn buffer_and_settle(
	state: AppState, fingerprint: String, model_id: String, max_cost_msat: i64, upstream_response: reqwest::Response,
) -> Response {
	let headers = relay_headers(upstream_response.headers());
	let body = match upstream_response.bytes().await {
		Ok(body) => body,
		Err(e) => {
			release(&state, &fingerprint, max_cost_msat);
			log::warn!("proxy: failed to read upstream body: {e}");
			return GatewayError::UpstreamTransport(e.to_string()).into_response();
		},
	};

	let usage = serde_json::from_slice::<serde_json::Value>(&body)
		.ok()
		.and_then(|v| v.get("usage").cloned())
		.and_then(|v| serde_json::from_value(v).ok());

	let settled = match cost::settle_cost(&state.catalog, &state.price_oracle, &model_id, usage.as_ref()) {
		SettlementOutcome::TokenBasedCost(amount) => amount,
		SettlementOutcome::MaxCost => max_cost_msat,
		SettlementOutcome::CostError => {
			log::warn!("proxy: settlement could not resolve model {model_id}; charging full reservation");
			max_cost_msat
		},
	};
	let clipped = cost::clip_to_reservation(settled, max_cost_msat, &model_id);

	if let Err(e) = state.credit.settle(&fingerprint, max_cost_msat, clipped) {
		log::error!("proxy: settle failed for {fingerprint}: {e}");
	}
	state.metrics.reservation_closed();
	state.metrics.record_settlement(clipped);
	log::info!("proxy: settled model={model_id} max_cost_msat={max_cost_msat} actual_cost_msat={clipped}");

	let mut response = Response::builder().status(StatusCode::OK);
	for (name, value) in headers.iter() {
		response = response.header(name, value);
	}
	response.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// STREAMING (spec §4.7): tee bytes to the client while an `SseUsageTee`
/// watches for the final `usage` object, settling exactly once whether the
/// stream ends naturally or the client disconnects mid-flight.
fn stream_and_settle(
	state: AppState, fingerprint: String, model_id: String, max_cost_msat: i64, upstream_response: reqwest::Response,
) -> Response {
	let headers = relay_headers(upstream_response.headers());
	let inner = upstream_response.bytes_stream();

	let settling = SettlingStream {
		inner: Box::pin(inner),
		tee: SseUsageTee::new(),
		catalog: state.catalog,
		price_oracle: state.price_oracle,
		credit: state.credit,
		metrics: state.metrics,
		fingerprint,
		model_id,
		max_cost_msat,
		finished: false,
	};

	let mut response = Response::builder().status(StatusCode::OK);
	for (name, value) in headers.iter() {
		response = response.header(name, value);
	}
	response
		.body(Body::from_stream(settling))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

struct SettlingStream {
	inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
	tee: SseUsageTee,
	catalog: std::sync::Arc<crate::catalog::Catalog>,
	price_oracle: crate::price_oracle::PriceOracle,
	credit: crate::credit::CreditStore,
	metrics: std::sync::Arc<crate::util::metrics::Metrics>,
	fingerprint: String,
	model_id: String,
	max_cost_msat: i64,
	finished: bool,
}

impl SettlingStream {
	/// Runs exactly once, whether reached from natural end-of-stream or
	/// from `Drop` on early cancellation (spec §5: "Never leak the
	/// reservation").
	fn finish(&mut self) {
		if self.finished {
			return;
		}
		self.finished = true;

		let usage = self.tee.finish();
		let settled = match cost::settle_cost(&self.catalog, &self.price_oracle, &self.model_id, usage.as_ref()) {
			SettlementOutcome::TokenBasedCost(amount) => amount,
			SettlementOutcome::MaxCost | SettlementOutcome::CostError => self.max_cost_msat,
		};
		let clipped = cost::clip_to_reservation(settled, self.max_cost_msat, &self.model_id);
		if let Err(e) = self.credit.settle(&self.fingerprint, self.max_cost_msat, clipped) {
			log::error!("proxy: streaming settle failed for {}: {e}", self.fingerprint);
		}
		self.metrics.reservation_closed();
		self.metrics.record_settlement(clipped);
		log::info!(
			"proxy: settled (stream) model={} max_cost_msat={} actual_cost_msat={}",
			self.model_id,
			self.max_cost_msat,
			clipped
		);
	}
}

impl Stream for SettlingStream {
	type Item = Result<Bytes, std::io::Error>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();
		match this.inner.as_mut().poll_next(cx) {
			Poll::Ready(Some(Ok(chunk))) => {
				this.tee.feed(&chunk);
				Poll::Ready(Some(Ok(chunk)))
			},
			Poll::Ready(Some(Err(e))) => {
				this.finish();
				Poll::Ready(Some(Err(std::io::Error::new(std::io::ErrorKind::Other, e))))
			},
			Poll::Ready(None) => {
				this.finish();
				Poll::Ready(None)
			},
			Poll::Pending => Poll::Pending,
		}
	}
}

impl Drop for SettlingStream {
	/// The client-disconnect cancellation path: axum drops the response
	/// body future without polling it to completion. This is the only
	/// place that guarantee is enforced for the streaming branch.
	fn drop(&mut self) {
		self.finish();
	}
}

/// Ephemeral-bearer path (spec §4.8), dispatched when `X-Cashu` is present.
async fn handle_ephemeral(
	state: AppState, path: String, method: Method, headers: HeaderMap, body: Bytes, bearer: String,
) -> Response {
	let redeemed = match ephemeral::redeem(state.wallet.as_ref(), &bearer).await {
		Ok(redeemed) => redeemed,
		Err(e) => return e.into_response(),
	};

	let model_id = match extract_model_id(&method, &path, &body) {
		Ok(model_id) => model_id,
		Err(e) => return e.into_response(),
	};

	let target = match router::resolve(&state.catalog, &model_id, &path) {
		Ok(target) => target,
		Err(e) => return e.into_response(),
	};

	let mut outbound_headers = router::rewrite_headers(&headers, &target.provider.api_key);
	outbound_headers.remove("x-cashu");

	let upstream = state
		.upstream_http_client
		.request(router::to_reqwest_method(&method), &target.url)
		.headers(outbound_headers)
		.body(body)
		.send()
		.await;

	let upstream_response = match upstream {
		Ok(resp) => resp,
		Err(e) => {
			log::warn!("ephemeral: upstream transport error: {e}");
			return emergency_refund_response(state, &redeemed, StatusCode::BAD_GATEWAY, Bytes::new()).await;
		},
	};

	if !upstream_response.status().is_success() {
		let status = upstream_response.status();
		let body = upstream_response.bytes().await.unwrap_or_default();
		return emergency_refund_response(state, &redeemed, status, body).await;
	}

	let is_stream = is_event_stream(upstream_response.headers());
	let headers_out = relay_headers(upstream_response.headers());
	let body = match upstream_response.bytes().await {
		Ok(body) => body,
		Err(_) => return emergency_refund_response(state, &redeemed, StatusCode::BAD_GATEWAY, Bytes::new()).await,
	};

	let actual_cost = ephemeral::settle_buffered(
		&state.catalog,
		&state.price_oracle,
		&model_id,
		redeemed.amount_msat,
		&body,
		is_stream,
		state.processing_fee_msat,
	);
	let remainder = redeemed.amount_msat - actual_cost;

	let refund_header = ephemeral::mint_refund_header(state.wallet.as_ref(), remainder, redeemed.unit, &redeemed.mint).await;

	let mut response = Response::builder().status(StatusCode::OK);
	for (name, value) in headers_out.iter() {
		response = response.header(name, value);
	}
	if let Ok(Some(header_value)) = refund_header {
		response = response.header("x-cashu", header_value);
	}
	response.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn emergency_refund_response(
	state: AppState, redeemed: &ephemeral::RedeemedEphemeral, status: StatusCode, upstream_body: Bytes,
) -> Response {
	let refund_header = ephemeral::refund_on_upstream_failure(state.wallet.as_ref(), redeemed, state.processing_fee_msat).await;
	let mut response = Response::builder().status(status);
	if let Ok(Some(header_value)) = refund_header {
		response = response.header("x-cashu", header_value);
	}
	response.body(Body::from(upstream_body)).unwrap_or_else(|_| status.into_response())
}

/// Extracts the `model` field from a JSON request body. `GET /v1/models`
/// carries no body and is not metered per-model; callers on that path
/// never reach here.
fn extract_model_id(_method: &Method, _path: &str, body: &Bytes) -> Result<String, GatewayError> {
	let value: serde_json::Value =
		serde_json::from_slice(body).map_err(|_| GatewayError::ModelNotFound("<unparseable request body>".to_string()))?;
	value
		.get("model")
		.and_then(|v| v.as_str())
		.map(str::to_string)
		.ok_or_else(|| GatewayError::ModelNotFound("<missing model field>".to_string()))
}

fn extract_max_completion_tokens(body: &Bytes) -> Option<i64> {
	let value: serde_json::Value = serde_json::from_slice(body).ok()?;
	value
		.get("max_completion_tokens")
		.or_else(|| value.get("max_tokens"))
		.and_then(|v| v.as_i64())
}

/// `GET /v1/models`: proxied without per-request metering against the
/// operator's configured default upstream (no single model applies).
pub(crate) async fn handle_models_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let now = chrono::Utc::now().timestamp();
	let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
	if let Err(e) = auth::authenticate(&state.credit, state.wallet.as_ref(), auth_header, AuthOptions::default(), now).await {
		return e.into_response();
	}

	let default_provider_id = match crate::catalog::lookup_setting(state.credit.pool(), "default_provider_id") {
		Ok(Some(id)) => id,
		_ => return GatewayError::Internal("no default_provider_id configured".to_string()).into_response(),
	};
	let provider = match state.catalog.provider(&default_provider_id) {
		Some(provider) => provider,
		None => return GatewayError::PricingNotFound(default_provider_id).into_response(),
	};

	let url = format!("{}/models", provider.base_url.trim_end_matches('/'));
	let outbound_headers = router::rewrite_headers(&headers, &provider.api_key);
	match state.upstream_http_client.get(&url).headers(outbound_headers).send().await {
		Ok(resp) => {
			let status = resp.status();
			let headers_out = relay_headers(resp.headers());
			let body = resp.bytes().await.unwrap_or_default();
			let mut response = Response::builder().status(status);
			for (name, value) in headers_out.iter() {
				response = response.header(name, value);
			}
			response.body(Body::from(body)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
		},
		Err(e) => GatewayError::UpstreamTransport(e.to_string()).into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::stream;

	#[test]
	fn extract_model_id_reads_model_field() {
		let body = Bytes::from_static(br#"{"model":"gpt-test","messages":[]}"#);
		assert_eq!(extract_model_id(&Method::POST, "v1/chat/completions", &body).unwrap(), "gpt-test");
	}

	#[test]
	fn extract_model_id_fails_on_missing_field() {
		let body = Bytes::from_static(br#"{"messages":[]}"#);
		assert!(extract_model_id(&Method::POST, "v1/chat/completions", &body).is_err());
	}

	#[test]
	fn extract_max_completion_tokens_prefers_new_field_name() {
		let body = Bytes::from_static(br#"{"max_completion_tokens":100,"max_tokens":50}"#);
		assert_eq!(extract_max_completion_tokens(&body), Some(100));
	}

	fn temp_credit_and_catalog() -> (crate::credit::CreditStore, std::sync::Arc<crate::catalog::Catalog>) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("proxy_test.sqlite3");
		std::mem::forget(dir);
		let store = crate::credit::CreditStore::open(&path).unwrap();
		let catalog = std::sync::Arc::new(crate::catalog::Catalog::load(store.pool().clone()).unwrap());
		(store, catalog)
	}

	/// A client disconnecting mid-stream drops the response body future
	/// without polling it to completion. The only hook for that is `Drop`,
	/// so this constructs a `SettlingStream` directly, feeds it two chunks,
	/// and drops it before the stream ends.
	#[test]
	fn dropping_settling_stream_mid_flight_settles_at_max_cost_exactly_once() {
		let (store, catalog) = temp_credit_and_catalog();
		store.ensure_credential("fp-disconnect", None, None, "msat", None, 0).unwrap();
		store.credit("fp-disconnect", 10_000).unwrap();
		assert_eq!(store.reserve("fp-disconnect", 1_000).unwrap(), ReserveOutcome::Ok);

		let chunks: Vec<reqwest::Result<Bytes>> =
			vec![Ok(Bytes::from_static(b"data: {\"choices\":[]}\n\n")), Ok(Bytes::from_static(b"data: more\n\n"))];
		let inner = stream::iter(chunks);

		let settling = SettlingStream {
			inner: Box::pin(inner),
			tee: SseUsageTee::new(),
			catalog,
			price_oracle: crate::price_oracle::PriceOracle::new(),
			credit: store.clone(),
			metrics: std::sync::Arc::new(crate::util::metrics::Metrics::new()),
			fingerprint: "fp-disconnect".to_string(),
			model_id: "m".to_string(),
			max_cost_msat: 1_000,
			finished: false,
		};

		// Never drives the stream to completion; emulates the client
		// disconnecting after two chunks with no terminal `usage` event.
		drop(settling);

		let after = store.get("fp-disconnect").unwrap().unwrap();
		assert_eq!(after.reserved_msat, 0);
		assert_eq!(after.balance_msat, 9_000);
	}
}
