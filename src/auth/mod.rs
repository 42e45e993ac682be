// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The authenticator (spec §4.1): resolves a bearer value to a credential
//! row, auto-materializing ephemeral ecash bearers.

use hex::DisplayHex;
use sha2::{Digest, Sha256};

use crate::api::error::GatewayError;
use crate::credit::{Credential, CreditStore};
use crate::wallet::WalletPrimitive;

pub(crate) const API_KEY_PREFIX: &str = "sk-";

pub(crate) fn fingerprint_of(bearer: &str) -> String {
	let digest = Sha256::digest(bearer.as_bytes());
	digest.as_slice().to_lower_hex_string()
}

/// Resolves `bearer` to the fingerprint identifying its credential row,
/// without redeeming or crediting anything: `sk-<fingerprint>` bearers carry
/// the fingerprint directly, everything else is an ecash token fingerprinted
/// by hash. Shared by `authenticate` and by any caller that only needs to
/// look up an existing credential, such as the refund path.
pub(crate) fn resolve_fingerprint(bearer: &str) -> Result<String, GatewayError> {
	match bearer.strip_prefix(API_KEY_PREFIX) {
		Some(fingerprint) if !fingerprint.is_empty() => Ok(fingerprint.to_string()),
		Some(_) => Err(GatewayError::InvalidToken),
		None => Ok(fingerprint_of(bearer)),
	}
}

/// Optional fields only honored at credential-creation time (spec §4.1,
/// plus `parent_fingerprint` for child keys per §11).
#[derive(Default)]
pub(crate) struct AuthOptions<'a> {
	pub(crate) refund_address: Option<&'a str>,
	pub(crate) refund_expiration: Option<i64>,
	pub(crate) parent_fingerprint: Option<&'a str>,
}

pub(crate) async fn authenticate(
	store: &CreditStore, wallet: &dyn WalletPrimitive, authorization_header: Option<&str>,
	options: AuthOptions<'_>, now: i64,
) -> Result<Credential, GatewayError> {
	let header = authorization_header.ok_or(GatewayError::Unauthorized)?;
	let bearer = header.strip_prefix("Bearer ").ok_or(GatewayError::Unauthorized)?;
	if bearer.is_empty() {
		return Err(GatewayError::Unauthorized);
	}

	if bearer.starts_with(API_KEY_PREFIX) {
		let fingerprint = resolve_fingerprint(bearer)?;
		return store
			.get(&fingerprint)
			.map_err(|e| GatewayError::Internal(e.to_string()))?
			.ok_or(GatewayError::Unauthorized);
	}

	authenticate_ecash_bearer(store, wallet, bearer, options, now).await
}

/// Redeems an ecash bearer and upserts/credits the credential it resolves
/// to. Shared by the persistent `Authorization` path and (with a fresh
/// fingerprint each call) the ephemeral `X-Cashu` path.
pub(crate) async fn authenticate_ecash_bearer(
	store: &CreditStore, wallet: &dyn WalletPrimitive, bearer: &str, options: AuthOptions<'_>, now: i64,
) -> Result<Credential, GatewayError> {
	let fingerprint = fingerprint_of(bearer);

	store
		.ensure_credential(
			&fingerprint,
			options.refund_address,
			options.refund_expiration,
			"msat",
			options.parent_fingerprint,
			now,
		)
		.map_err(|e| GatewayError::Internal(e.to_string()))?;

	let redeemed = wallet.receive(bearer).await.map_err(|err| match err {
		crate::wallet::WalletError::AlreadySpent => GatewayError::AlreadySpent,
		crate::wallet::WalletError::Invalid => GatewayError::InvalidToken,
		crate::wallet::WalletError::MintError(msg) => GatewayError::PaymentServiceUnavailable(msg),
	})?;

	store
		.credit(&fingerprint, redeemed.amount_msat)
		.map_err(|e| GatewayError::Internal(e.to_string()))?;

	store
		.get(&fingerprint)
		.map_err(|e| GatewayError::Internal(e.to_string()))?
		.ok_or_else(|| GatewayError::Internal("credential vanished immediately after credit".to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_is_stable_sha256_hex() {
		let a = fingerprint_of("cashuAtestbearer");
		let b = fingerprint_of("cashuAtestbearer");
		assert_eq!(a, b);
		assert_eq!(a.len(), 64);
		assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn resolve_fingerprint_strips_api_key_prefix_without_hashing() {
		assert_eq!(resolve_fingerprint("sk-abc123").unwrap(), "abc123");
	}

	#[test]
	fn resolve_fingerprint_rejects_bare_prefix() {
		assert!(resolve_fingerprint("sk-").is_err());
	}

	#[test]
	fn resolve_fingerprint_hashes_ecash_bearers() {
		assert_eq!(resolve_fingerprint("cashuAtestbearer").unwrap(), fingerprint_of("cashuAtestbearer"));
	}

	#[test]
	fn different_bearers_fingerprint_differently() {
		assert_ne!(fingerprint_of("a"), fingerprint_of("b"));
	}
}
