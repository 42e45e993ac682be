// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The refund path (spec §4.5): drains a credential's remaining balance back
//! into an ecash bearer or an external payout, idempotent by bearer for a
//! short TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::error::GatewayError;
use crate::auth::resolve_fingerprint;
use crate::credit::CreditStore;
use crate::wallet::{Unit, WalletPrimitive};

/// Default idempotency TTL, overridable via `METERPROXY_REFUND_CACHE_TTL_SECS`.
const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(5 * 60);

/// Either a minted ecash bearer or a confirmation that an external payout
/// landed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PayoutArtifact {
	Token(String),
	Recipient(String),
}

/// The TTL-keyed idempotency cache (spec §4.5, §5: "protected by a mutex
/// covering the map and its expiry checks").
pub(crate) struct RefundCache {
	entries: Mutex<HashMap<String, (Instant, PayoutArtifact)>>,
	ttl: Duration,
}

impl RefundCache {
	pub(crate) fn new() -> Self {
		Self::with_ttl(DEFAULT_IDEMPOTENCY_TTL)
	}

	pub(crate) fn with_ttl(ttl: Duration) -> Self {
		Self { entries: Mutex::new(HashMap::new()), ttl }
	}

	fn get(&self, key: &str) -> Option<PayoutArtifact> {
		let mut entries = self.entries.lock().expect("refund cache lock poisoned");
		match entries.get(key) {
			Some((inserted_at, artifact)) if inserted_at.elapsed() < self.ttl => {
				Some(artifact.clone())
			},
			Some(_) => {
				entries.remove(key);
				None
			},
			None => None,
		}
	}

	fn insert(&self, key: String, artifact: PayoutArtifact) {
		let mut entries = self.entries.lock().expect("refund cache lock poisoned");
		entries.insert(key, (Instant::now(), artifact));
	}
}

impl Default for RefundCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Drains the credential keyed by `bearer` (spec §4.5 operation). Resolves
/// `bearer` through the same `sk-`/ecash branching the authenticator uses,
/// so a persistent API key and an ecash bearer both resolve to the
/// fingerprint identifying their credential row rather than always hashing
/// the raw header value.
pub(crate) async fn refund(
	store: &CreditStore, wallet: &dyn WalletPrimitive, cache: &RefundCache, bearer: &str,
) -> Result<PayoutArtifact, GatewayError> {
	let fingerprint = resolve_fingerprint(bearer)?;
	if let Some(cached) = cache.get(&fingerprint) {
		return Ok(cached);
	}

	let credential =
		store.get(&fingerprint).map_err(|e| GatewayError::Internal(e.to_string()))?.ok_or(GatewayError::Unauthorized)?;

	if credential.reserved_msat > 0 {
		return Err(GatewayError::RefundBlocked);
	}

	let unit = Unit::parse(&credential.refund_currency);
	let amount_native = unit.from_msat(credential.balance_msat);
	if amount_native <= 0 {
		return Err(GatewayError::BalanceTooSmall);
	}

	let mint = credential.refund_mint.as_deref().unwrap_or("https://mint.minibits.cash/Bitcoin");

	let artifact = if let Some(address) = credential.refund_address.as_deref() {
		wallet
			.send_to_address(credential.balance_msat, unit, mint, address)
			.await
			.map_err(map_wallet_error)?;
		PayoutArtifact::Recipient(address.to_string())
	} else {
		let token = wallet.send(credential.balance_msat, unit, mint).await.map_err(map_wallet_error)?;
		PayoutArtifact::Token(token)
	};

	store.delete(&fingerprint).map_err(|e| GatewayError::Internal(e.to_string()))?;
	cache.insert(fingerprint, artifact.clone());
	Ok(artifact)
}

fn map_wallet_error(err: crate::wallet::WalletError) -> GatewayError {
	match err {
		crate::wallet::WalletError::AlreadySpent => GatewayError::AlreadySpent,
		crate::wallet::WalletError::Invalid => GatewayError::InvalidToken,
		crate::wallet::WalletError::MintError(msg) => GatewayError::PaymentServiceUnavailable(msg),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::fingerprint_of;
	use crate::wallet::Redeemed;

	#[derive(Default)]
	struct StubWallet {
		send_calls: std::sync::atomic::AtomicUsize,
	}

	#[async_trait::async_trait]
	impl WalletPrimitive for StubWallet {
		async fn receive(&self, _token: &str) -> Result<Redeemed, crate::wallet::WalletError> {
			unreachable!("refund path never redeems")
		}
		async fn send(
			&self, amount: i64, _unit: Unit, _mint: &str,
		) -> Result<String, crate::wallet::WalletError> {
			self.send_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(format!("cashuB{amount}"))
		}
		async fn send_to_address(
			&self, _amount: i64, _unit: Unit, _mint: &str, _address: &str,
		) -> Result<(), crate::wallet::WalletError> {
			Ok(())
		}
	}

	fn temp_store() -> CreditStore {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("refund_test.sqlite3");
		std::mem::forget(dir);
		CreditStore::open(&path).unwrap()
	}

	#[tokio::test]
	async fn refund_blocked_while_reservation_outstanding() {
		let store = temp_store();
		let bearer = "cashuAtokenwithopenreservation";
		let fingerprint = fingerprint_of(bearer);
		store.ensure_credential(&fingerprint, None, None, "msat", None, 0).unwrap();
		store.credit(&fingerprint, 1000).unwrap();
		store.reserve(&fingerprint, 500).unwrap();

		let wallet = StubWallet::default();
		let cache = RefundCache::new();
		let err = refund(&store, &wallet, &cache, bearer).await.unwrap_err();
		assert!(matches!(err, GatewayError::RefundBlocked));
	}

	#[tokio::test]
	async fn refund_drains_balance_and_deletes_row() {
		let store = temp_store();
		let bearer = "cashuAactualbearer";
		let fingerprint = fingerprint_of(bearer);
		store.ensure_credential(&fingerprint, None, None, "msat", None, 0).unwrap();
		store.credit(&fingerprint, 5000).unwrap();

		let wallet = StubWallet::default();
		let cache = RefundCache::new();
		let artifact = refund(&store, &wallet, &cache, bearer).await.unwrap();
		assert_eq!(artifact, PayoutArtifact::Token("cashuB5000".to_string()));
		assert!(store.get(&fingerprint).unwrap().is_none());
	}

	#[tokio::test]
	async fn second_refund_within_ttl_is_idempotent() {
		let store = temp_store();
		let bearer = "cashuArepeatbearer";
		let fingerprint = fingerprint_of(bearer);
		store.ensure_credential(&fingerprint, None, None, "msat", None, 0).unwrap();
		store.credit(&fingerprint, 2500).unwrap();

		let wallet = StubWallet::default();
		let cache = RefundCache::new();
		let first = refund(&store, &wallet, &cache, bearer).await.unwrap();
		// Row is gone now; a naive second call would fail lookup, but the
		// cache must short-circuit before that lookup happens.
		let second = refund(&store, &wallet, &cache, bearer).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(wallet.send_calls.load(std::sync::atomic::Ordering::SeqCst), 1, "wallet must be invoked at most once");
	}

	/// A persistent API key bearer (`sk-<fingerprint>`) must resolve to the
	/// same credential row `handle_info`/`handle_topup` reach through
	/// `auth::authenticate`, not be hashed as if it were an ecash token.
	#[tokio::test]
	async fn refund_resolves_api_key_bearer_to_its_fingerprint() {
		let store = temp_store();
		let fingerprint = "abc123fingerprint";
		store.ensure_credential(fingerprint, None, None, "msat", None, 0).unwrap();
		store.credit(fingerprint, 4000).unwrap();

		let wallet = StubWallet::default();
		let cache = RefundCache::new();
		let bearer = format!("sk-{fingerprint}");
		let artifact = refund(&store, &wallet, &cache, &bearer).await.unwrap();
		assert_eq!(artifact, PayoutArtifact::Token("cashuB4000".to_string()));
		assert!(store.get(fingerprint).unwrap().is_none());
	}

	#[tokio::test]
	async fn balance_too_small_after_unit_conversion() {
		let store = temp_store();
		let bearer = "cashuAdustbearer";
		let fingerprint = fingerprint_of(bearer);
		store.ensure_credential(&fingerprint, None, None, "sat", None, 0).unwrap();
		store.credit(&fingerprint, 999).unwrap();

		let wallet = StubWallet::default();
		let cache = RefundCache::new();
		let err = refund(&store, &wallet, &cache, bearer).await.unwrap_err();
		assert!(matches!(err, GatewayError::BalanceTooSmall));
	}
}
