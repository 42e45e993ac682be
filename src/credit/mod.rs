// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The credit store: a persistent `fingerprint -> balance` mapping with four
//! atomic SQL adjustment primitives (spec §4.4). Every mutation is a single
//! `UPDATE ... WHERE` statement; there is no read-modify-write in this file.

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

pub(crate) mod schema;

pub(crate) type DbPool = Pool<SqliteConnectionManager>;

/// A credential row (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Credential {
	pub(crate) fingerprint: String,
	pub(crate) balance_msat: i64,
	pub(crate) reserved_msat: i64,
	pub(crate) refund_address: Option<String>,
	pub(crate) refund_mint: Option<String>,
	pub(crate) refund_currency: String,
	pub(crate) parent_fingerprint: Option<String>,
	pub(crate) created_at: i64,
	pub(crate) refund_expiration: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReserveOutcome {
	Ok,
	Insufficient,
}

/// The process-lifetime singleton wrapping the pooled SQLite connection
/// (spec §5: "a single SQL connection pool ... initialized at startup").
#[derive(Clone)]
pub(crate) struct CreditStore {
	pool: Arc<DbPool>,
}

impl CreditStore {
	pub(crate) fn open(path: &Path) -> rusqlite::Result<Self> {
		let manager = SqliteConnectionManager::file(path).with_init(|conn| {
			conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
		});
		let pool = Pool::builder().max_size(16).build(manager).expect("failed to build DB pool");
		let conn = pool.get().expect("failed to acquire init connection");
		schema::migrate(&conn)?;
		Ok(Self { pool: Arc::new(pool) })
	}

	fn conn(&self) -> r2d2::PooledConnection<SqliteConnectionManager> {
		self.pool.get().expect("credit store connection pool exhausted")
	}

	/// Exposes the underlying pool so sibling modules (the catalog, the
	/// router) can share the same SQLite file without each opening their
	/// own connection manager.
	pub(crate) fn pool(&self) -> &DbPool {
		&self.pool
	}

	/// Create a credential row if absent. Never overwrites an existing row's
	/// `refund_address`/`refund_expiration` (spec §4.1: "only set, never
	/// overwritten on subsequent accesses").
	pub(crate) fn ensure_credential(
		&self, fingerprint: &str, refund_address: Option<&str>, refund_expiration: Option<i64>,
		refund_currency: &str, parent_fingerprint: Option<&str>, created_at: i64,
	) -> rusqlite::Result<()> {
		let conn = self.conn();
		conn.execute(
			"INSERT INTO credential (fingerprint, balance_msat, reserved_msat, refund_address, refund_mint, refund_currency, parent_fingerprint, created_at, refund_expiration) \
			 VALUES (?1, 0, 0, ?2, NULL, ?3, ?4, ?5, ?6) \
			 ON CONFLICT(fingerprint) DO NOTHING",
			params![fingerprint, refund_address, refund_currency, parent_fingerprint, created_at, refund_expiration],
		)?;
		Ok(())
	}

	pub(crate) fn get(&self, fingerprint: &str) -> rusqlite::Result<Option<Credential>> {
		let conn = self.conn();
		conn.query_row(
			"SELECT fingerprint, balance_msat, reserved_msat, refund_address, refund_mint, refund_currency, parent_fingerprint, created_at, refund_expiration \
			 FROM credential WHERE fingerprint = ?1",
			params![fingerprint],
			row_to_credential,
		)
		.optional()
	}

	/// `UPDATE credential SET balance_msat = balance_msat + amount WHERE fingerprint = ?`.
	pub(crate) fn credit(&self, fingerprint: &str, amount_msat: i64) -> rusqlite::Result<()> {
		debug_assert!(amount_msat >= 0);
		let conn = self.conn();
		conn.execute(
			"UPDATE credential SET balance_msat = balance_msat + ?2 WHERE fingerprint = ?1",
			params![fingerprint, amount_msat],
		)?;
		Ok(())
	}

	/// `reserve` — the only statement that can fail the request (insufficient
	/// balance). The `WHERE balance_msat >= amount` predicate is what
	/// prevents over-reservation under concurrency.
	pub(crate) fn reserve(
		&self, fingerprint: &str, amount_msat: i64,
	) -> rusqlite::Result<ReserveOutcome> {
		debug_assert!(amount_msat >= 0);
		let conn = self.conn();
		let updated = conn.execute(
			"UPDATE credential SET balance_msat = balance_msat - ?2, reserved_msat = reserved_msat + ?2 \
			 WHERE fingerprint = ?1 AND balance_msat >= ?2",
			params![fingerprint, amount_msat],
		)?;
		Ok(if updated == 1 { ReserveOutcome::Ok } else { ReserveOutcome::Insufficient })
	}

	/// `settle` — releases `reserved_amount` and charges `actual_amount`,
	/// clipped to `[0, reserved_amount]` by the caller (cost model enforces
	/// the clip; this statement trusts its input, matching spec's "single
	/// atomic SQL statement; no read-modify-write in application code").
	pub(crate) fn settle(
		&self, fingerprint: &str, reserved_amount: i64, actual_amount: i64,
	) -> rusqlite::Result<()> {
		debug_assert!((0..=reserved_amount).contains(&actual_amount));
		let conn = self.conn();
		conn.execute(
			"UPDATE credential SET reserved_msat = reserved_msat - ?2, balance_msat = balance_msat + (?2 - ?3) \
			 WHERE fingerprint = ?1",
			params![fingerprint, reserved_amount, actual_amount],
		)?;
		Ok(())
	}

	/// `release` — equivalent to `settle(.., 0)`; used on upstream failure.
	pub(crate) fn release(&self, fingerprint: &str, reserved_amount: i64) -> rusqlite::Result<()> {
		self.settle(fingerprint, reserved_amount, 0)
	}

	/// Deletes the credential row. Only called by the refund path, and only
	/// once `reserved_msat == 0` has been verified by the caller.
	pub(crate) fn delete(&self, fingerprint: &str) -> rusqlite::Result<()> {
		let conn = self.conn();
		conn.execute("DELETE FROM credential WHERE fingerprint = ?1", params![fingerprint])?;
		Ok(())
	}
}

fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
	Ok(Credential {
		fingerprint: row.get(0)?,
		balance_msat: row.get(1)?,
		reserved_msat: row.get(2)?,
		refund_address: row.get(3)?,
		refund_mint: row.get(4)?,
		refund_currency: row.get(5)?,
		parent_fingerprint: row.get(6)?,
		created_at: row.get(7)?,
		refund_expiration: row.get(8)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};
	use std::thread;

	fn temp_store() -> CreditStore {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("credit.sqlite3");
		// Leak the tempdir so the file outlives this function; tests are
		// short-lived processes so this is not a real leak in practice.
		std::mem::forget(dir);
		CreditStore::open(&path).unwrap()
	}

	#[test]
	fn reserve_then_settle_round_trips_balance() {
		let store = temp_store();
		store.ensure_credential("fp1", None, None, "msat", None, 0).unwrap();
		store.credit("fp1", 10_000_000).unwrap();

		assert_eq!(store.reserve("fp1", 200_000).unwrap(), ReserveOutcome::Ok);
		let mid = store.get("fp1").unwrap().unwrap();
		assert_eq!(mid.balance_msat, 9_800_000);
		assert_eq!(mid.reserved_msat, 200_000);

		store.settle("fp1", 200_000, 150).unwrap();
		let after = store.get("fp1").unwrap().unwrap();
		assert_eq!(after.balance_msat, 9_999_850);
		assert_eq!(after.reserved_msat, 0);
	}

	#[test]
	fn release_is_settle_with_zero_actual() {
		let store = temp_store();
		store.ensure_credential("fp2", None, None, "msat", None, 0).unwrap();
		store.credit("fp2", 500).unwrap();
		assert_eq!(store.reserve("fp2", 500).unwrap(), ReserveOutcome::Ok);
		store.release("fp2", 500).unwrap();
		let after = store.get("fp2").unwrap().unwrap();
		assert_eq!(after.balance_msat, 500);
		assert_eq!(after.reserved_msat, 0);
	}

	#[test]
	fn insufficient_reservation_leaves_balance_untouched() {
		let store = temp_store();
		store.ensure_credential("fp3", None, None, "msat", None, 0).unwrap();
		store.credit("fp3", 100).unwrap();
		assert_eq!(store.reserve("fp3", 200).unwrap(), ReserveOutcome::Insufficient);
		let after = store.get("fp3").unwrap().unwrap();
		assert_eq!(after.balance_msat, 100);
		assert_eq!(after.reserved_msat, 0);
	}

	/// Concurrent reservations against a credential starting at balance `B`
	/// never succeed for more than `B` in total.
	#[test]
	fn concurrent_reservations_never_over_reserve() {
		let store = temp_store();
		store.ensure_credential("fp4", None, None, "msat", None, 0).unwrap();
		let balance = 1_500_000i64;
		store.credit("fp4", balance).unwrap();

		let amount = 1_000_000i64;
		let handles: Vec<_> = (0..2)
			.map(|_| {
				let store = store.clone();
				thread::spawn(move || store.reserve("fp4", amount).unwrap())
			})
			.collect();
		let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		let successes = results.iter().filter(|r| **r == ReserveOutcome::Ok).count();
		assert_eq!(successes, 1, "exactly one of two {amount}-reservations against {balance} should succeed");
	}

	/// Randomized reserve/settle sequences never change `balance + reserved`
	/// by anything other than `-settled`.
	#[test]
	fn randomized_reserve_settle_preserves_invariant() {
		let store = temp_store();
		store.ensure_credential("fp5", None, None, "msat", None, 0).unwrap();
		let initial = 50_000_000i64;
		store.credit("fp5", initial).unwrap();

		let mut rng = StdRng::seed_from_u64(42);
		let mut total_settled = 0i64;
		for _ in 0..200 {
			let max_cost = rng.gen_range(0..100_000);
			if store.reserve("fp5", max_cost).unwrap() == ReserveOutcome::Ok {
				let actual = rng.gen_range(0..=max_cost);
				store.settle("fp5", max_cost, actual).unwrap();
				total_settled += actual;
			}
		}
		let final_row = store.get("fp5").unwrap().unwrap();
		assert_eq!(final_row.reserved_msat, 0);
		assert_eq!(final_row.balance_msat, initial - total_settled);
	}
}
