// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The upstream router (spec §4.6): resolves a model id to the upstream
//! provider to forward the request to, and rewrites the outbound path and
//! headers.

use crate::api::error::GatewayError;
use crate::catalog::{Catalog, ProviderDescriptor};

pub(crate) struct Target {
	pub(crate) provider: ProviderDescriptor,
	pub(crate) url: String,
}

/// Hop-by-hop and sensitive headers stripped before forwarding upstream
/// (spec §4.6).
const STRIPPED_HEADERS: &[&str] = &["host", "content-length", "x-cashu", "x-refund-address", "x-refund-mint"];

pub(crate) fn resolve(catalog: &Catalog, model_id: &str, client_path: &str) -> Result<Target, GatewayError> {
	let model = catalog.model(model_id).ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))?;
	let provider = catalog
		.provider(&model.upstream_provider_id)
		.ok_or_else(|| GatewayError::PricingNotFound(model.upstream_provider_id.clone()))?;

	let stripped_path = client_path.strip_prefix("v1/").unwrap_or(client_path);
	let base = provider.base_url.trim_end_matches('/');
	let url = format!("{base}/{stripped_path}");

	Ok(Target { provider, url })
}

/// Rewrites inbound client headers into the headers sent upstream: replaces
/// `Authorization` with the provider's own key, drops hop-by-hop and
/// credit-system headers. Axum's extractors hand back `http` 1.x header
/// types; `reqwest` 0.11 is built on `http` 0.2. The two are different
/// types with the same shape, so the crossing happens here, byte for byte,
/// rather than anywhere a handler has to think about it.
pub(crate) fn rewrite_headers(
	inbound: &axum::http::HeaderMap, provider_api_key: &str,
) -> reqwest::header::HeaderMap {
	let mut out = reqwest::header::HeaderMap::new();
	for (name, value) in inbound.iter() {
		if STRIPPED_HEADERS.contains(&name.as_str()) || name.as_str().eq_ignore_ascii_case("authorization") {
			continue;
		}
		if let (Ok(name), Ok(value)) = (
			reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
			reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
		) {
			out.insert(name, value);
		}
	}

	if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {provider_api_key}")) {
		out.insert(reqwest::header::AUTHORIZATION, value);
	}

	out
}

/// `axum::http::Method` (http 1.x) to `reqwest::Method` (http 0.2); same
/// byte-for-byte crossing as `rewrite_headers`.
pub(crate) fn to_reqwest_method(method: &axum::http::Method) -> reqwest::Method {
	reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

#[cfg(test)]
mod tests {
	use axum::http::HeaderValue;

	use super::*;

	fn axum_headers(pairs: &[(&str, &str)]) -> axum::http::HeaderMap {
		let mut map = axum::http::HeaderMap::new();
		for (name, value) in pairs {
			map.insert(axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(), HeaderValue::from_str(value).unwrap());
		}
		map
	}

	fn provider() -> ProviderDescriptor {
		ProviderDescriptor {
			id: "openai".to_string(),
			provider_type: "openai".to_string(),
			base_url: "https://api.openai.com/v1".to_string(),
			api_key: "sk-upstream-secret".to_string(),
			provider_fee_multiplier: 1.0,
		}
	}

	fn temp_store() -> crate::credit::CreditStore {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("router_test.sqlite3");
		std::mem::forget(dir);
		crate::credit::CreditStore::open(&path).unwrap()
	}

	#[test]
	fn resolve_strips_v1_prefix_and_joins_base_url() {
		let store = temp_store();
		crate::catalog::upsert_provider(store.pool(), &provider()).unwrap();
		crate::catalog::upsert_model(
			store.pool(),
			&crate::catalog::ModelDescriptor {
				id: "gpt-test".to_string(),
				upstream_provider_id: "openai".to_string(),
				context_length: None,
				prompt_msat_per_token: None,
				completion_msat_per_token: None,
				completion_image_msat_per_token: None,
				request_fee_msat: None,
				max_cost_msat: None,
			},
		)
		.unwrap();

		let catalog = Catalog::load(store.pool().clone()).unwrap();
		let target = resolve(&catalog, "gpt-test", "v1/chat/completions").unwrap();
		assert_eq!(target.url, "https://api.openai.com/v1/chat/completions");
	}

	#[test]
	fn rewrite_headers_drops_sensitive_and_hop_by_hop_headers() {
		let inbound = axum_headers(&[
			("authorization", "Bearer cashuAtoken"),
			("host", "proxy.example"),
			("x-cashu", "cashuBtoken"),
			("content-type", "application/json"),
		]);

		let rewritten = rewrite_headers(&inbound, "sk-upstream-secret");
		assert_eq!(rewritten.get("authorization").unwrap(), "Bearer sk-upstream-secret");
		assert!(rewritten.get("host").is_none());
		assert!(rewritten.get("x-cashu").is_none());
		assert_eq!(rewritten.get("content-type").unwrap(), "application/json");
	}
}
