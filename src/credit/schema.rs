// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Schema creation, grounded on the shape of
//! `original_source/migrations/versions/*` (composite-pk models table,
//! `upstream_provider` table, settings key-value table) but expressed as a
//! single idempotent `CREATE TABLE IF NOT EXISTS` batch rather than a chain
//! of Alembic revisions — migration tooling is explicitly out of scope
//! (spec §1).

use rusqlite::Connection;

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
	conn.execute_batch(
		"
		CREATE TABLE IF NOT EXISTS credential (
			fingerprint       TEXT PRIMARY KEY,
			balance_msat      INTEGER NOT NULL DEFAULT 0,
			reserved_msat     INTEGER NOT NULL DEFAULT 0,
			refund_address    TEXT,
			refund_mint       TEXT,
			refund_currency   TEXT NOT NULL DEFAULT 'msat',
			parent_fingerprint TEXT,
			created_at        INTEGER NOT NULL,
			refund_expiration INTEGER,
			CHECK (balance_msat >= 0),
			CHECK (reserved_msat >= 0)
		);

		CREATE TABLE IF NOT EXISTS upstream_provider (
			id                      TEXT PRIMARY KEY,
			provider_type           TEXT NOT NULL,
			base_url                TEXT NOT NULL,
			api_key                 TEXT NOT NULL,
			provider_fee_multiplier REAL NOT NULL DEFAULT 1.01
		);

		CREATE TABLE IF NOT EXISTS model (
			id                             TEXT PRIMARY KEY,
			upstream_provider_id           TEXT NOT NULL REFERENCES upstream_provider(id),
			context_length                 INTEGER,
			prompt_msat_per_token          REAL,
			completion_msat_per_token      REAL,
			completion_image_msat_per_token REAL,
			request_fee_msat              INTEGER,
			max_cost_msat                  INTEGER
		);

		CREATE TABLE IF NOT EXISTS settings (
			key   TEXT PRIMARY KEY,
			value TEXT NOT NULL
		);
		",
	)
}
