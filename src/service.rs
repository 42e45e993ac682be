// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Process-lifetime shared state and the axum router wiring it to handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{admin, balance, proxy};
use crate::catalog::Catalog;
use crate::credit::CreditStore;
use crate::payment_methods::PaymentMethodRegistry;
use crate::price_oracle::PriceOracle;
use crate::refund::RefundCache;
use crate::util::metrics::Metrics;
use crate::wallet::WalletPrimitive;

/// The shared state handed to every handler via axum's `State` extractor
/// (spec §5: "shared resources ... process-lifetime singletons initialized
/// at startup").
#[derive(Clone)]
pub(crate) struct AppState {
	pub(crate) credit: CreditStore,
	pub(crate) catalog: Arc<Catalog>,
	pub(crate) price_oracle: PriceOracle,
	pub(crate) wallet: Arc<dyn WalletPrimitive>,
	/// Used to forward proxy/ephemeral/model-listing requests to upstream
	/// LLM providers. No request-level timeout: completions can legitimately
	/// run far longer than any bounded client would allow (spec §5).
	pub(crate) upstream_http_client: reqwest::Client,
	pub(crate) refund_cache: Arc<RefundCache>,
	pub(crate) payment_methods: Arc<PaymentMethodRegistry>,
	pub(crate) processing_fee_msat: i64,
	pub(crate) metrics: Arc<Metrics>,
	/// Gates `src/api/admin.rs`'s catalog write routes (§10.3). `None`
	/// leaves the admin surface disabled entirely rather than open.
	pub(crate) admin_password: Option<String>,
}

/// A bounded client for collaborators that make short, time-boxed calls —
/// currently only the price oracle's exchange-rate polling.
pub(crate) fn build_bounded_http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.timeout(Duration::from_secs(120))
		.pool_idle_timeout(Duration::from_secs(90))
		.build()
		.expect("failed to build bounded HTTP client")
}

/// No total-request timeout: upstream LLM completions can stream for an
/// arbitrarily long time and must not be aborted by the client itself.
pub(crate) fn build_upstream_http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.pool_idle_timeout(Duration::from_secs(90))
		.build()
		.expect("failed to build upstream HTTP client")
}

/// Builds the full router: the balance-management surface, then the
/// catch-all proxy surface last so it does not shadow the more specific
/// routes above it.
pub(crate) fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/v1/balance/info", get(balance::handle_info))
		.route("/v1/balance/create", get(balance::handle_create))
		.route("/v1/balance/topup", post(balance::handle_topup))
		.route("/v1/balance/refund", post(balance::handle_refund))
		.route("/v1/admin/models", post(admin::handle_upsert_model))
		.route("/v1/admin/providers", post(admin::handle_upsert_provider))
		.route("/v1/models", get(proxy::handle_models_list))
		.route("/*path", axum::routing::any(proxy::handle_proxy))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}
