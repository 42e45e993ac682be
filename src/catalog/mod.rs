// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The model/provider catalog (§3, §10.3): a read-mostly cache over two
//! SQLite tables, refreshed on a timer so the hot request path never blocks
//! on a table scan. `upsert_model`/`upsert_provider` are the only writers,
//! reachable solely through the admin-gated routes in `api/admin.rs`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;

use crate::credit::DbPool;

/// Model descriptor (spec §3).
#[derive(Debug, Clone)]
pub(crate) struct ModelDescriptor {
	pub(crate) id: String,
	pub(crate) upstream_provider_id: String,
	pub(crate) context_length: Option<i64>,
	pub(crate) prompt_msat_per_token: Option<f64>,
	pub(crate) completion_msat_per_token: Option<f64>,
	pub(crate) completion_image_msat_per_token: Option<f64>,
	pub(crate) request_fee_msat: Option<i64>,
	pub(crate) max_cost_msat: Option<i64>,
}

/// Upstream provider descriptor (spec §3).
#[derive(Debug, Clone)]
pub(crate) struct ProviderDescriptor {
	pub(crate) id: String,
	pub(crate) provider_type: String,
	pub(crate) base_url: String,
	pub(crate) api_key: String,
	pub(crate) provider_fee_multiplier: f64,
}

struct CatalogSnapshot {
	models: HashMap<String, ModelDescriptor>,
	providers: HashMap<String, ProviderDescriptor>,
	loaded_at: Instant,
}

pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct Catalog {
	pool: DbPool,
	snapshot: RwLock<CatalogSnapshot>,
}

impl Catalog {
	pub(crate) fn load(pool: DbPool) -> rusqlite::Result<Self> {
		let snapshot = load_snapshot(&pool)?;
		Ok(Self { pool, snapshot: RwLock::new(snapshot) })
	}

	fn refresh_if_stale(&self) {
		let stale = {
			let guard = self.snapshot.read().expect("catalog lock poisoned");
			guard.loaded_at.elapsed() > REFRESH_INTERVAL
		};
		if stale {
			if let Ok(fresh) = load_snapshot(&self.pool) {
				*self.snapshot.write().expect("catalog lock poisoned") = fresh;
			} else {
				log::warn!("catalog refresh failed, continuing to serve the stale snapshot");
			}
		}
	}

	pub(crate) fn model(&self, id: &str) -> Option<ModelDescriptor> {
		self.refresh_if_stale();
		self.snapshot.read().expect("catalog lock poisoned").models.get(id).cloned()
	}

	pub(crate) fn provider(&self, id: &str) -> Option<ProviderDescriptor> {
		self.refresh_if_stale();
		self.snapshot.read().expect("catalog lock poisoned").providers.get(id).cloned()
	}

	/// Forces the next read to reload from the table, instead of waiting up
	/// to `REFRESH_INTERVAL` for the timer. Called after an admin write so
	/// the new row is visible immediately.
	pub(crate) fn invalidate(&self) {
		if let Ok(fresh) = load_snapshot(&self.pool) {
			*self.snapshot.write().expect("catalog lock poisoned") = fresh;
		}
	}
}

fn load_snapshot(
	pool: &r2d2::Pool<SqliteConnectionManager>,
) -> rusqlite::Result<CatalogSnapshot> {
	let conn = pool.get().expect("catalog connection pool exhausted");

	let mut providers = HashMap::new();
	let mut stmt = conn.prepare(
		"SELECT id, provider_type, base_url, api_key, provider_fee_multiplier FROM upstream_provider",
	)?;
	let rows = stmt.query_map([], |row| {
		Ok(ProviderDescriptor {
			id: row.get(0)?,
			provider_type: row.get(1)?,
			base_url: row.get(2)?,
			api_key: row.get(3)?,
			provider_fee_multiplier: row.get(4)?,
		})
	})?;
	for row in rows {
		let provider = row?;
		providers.insert(provider.id.clone(), provider);
	}

	let mut models = HashMap::new();
	let mut stmt = conn.prepare(
		"SELECT id, upstream_provider_id, context_length, prompt_msat_per_token, completion_msat_per_token, \
		        completion_image_msat_per_token, request_fee_msat, max_cost_msat FROM model",
	)?;
	let rows = stmt.query_map([], |row| {
		Ok(ModelDescriptor {
			id: row.get(0)?,
			upstream_provider_id: row.get(1)?,
			context_length: row.get(2)?,
			prompt_msat_per_token: row.get(3)?,
			completion_msat_per_token: row.get(4)?,
			completion_image_msat_per_token: row.get(5)?,
			request_fee_msat: row.get(6)?,
			max_cost_msat: row.get(7)?,
		})
	})?;
	for row in rows {
		let model = row?;
		models.insert(model.id.clone(), model);
	}

	Ok(CatalogSnapshot { models, providers, loaded_at: Instant::now() })
}

/// Inserts or replaces a model row by id (§10.3's write path).
pub(crate) fn upsert_model(pool: &DbPool, model: &ModelDescriptor) -> rusqlite::Result<()> {
	let conn = pool.get().expect("catalog connection pool exhausted");
	conn.execute(
		"INSERT INTO model (id, upstream_provider_id, context_length, prompt_msat_per_token, completion_msat_per_token, completion_image_msat_per_token, request_fee_msat, max_cost_msat) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
		 ON CONFLICT(id) DO UPDATE SET \
		   upstream_provider_id = excluded.upstream_provider_id, \
		   context_length = excluded.context_length, \
		   prompt_msat_per_token = excluded.prompt_msat_per_token, \
		   completion_msat_per_token = excluded.completion_msat_per_token, \
		   completion_image_msat_per_token = excluded.completion_image_msat_per_token, \
		   request_fee_msat = excluded.request_fee_msat, \
		   max_cost_msat = excluded.max_cost_msat",
		rusqlite::params![
			model.id,
			model.upstream_provider_id,
			model.context_length,
			model.prompt_msat_per_token,
			model.completion_msat_per_token,
			model.completion_image_msat_per_token,
			model.request_fee_msat,
			model.max_cost_msat,
		],
	)?;
	Ok(())
}

pub(crate) fn upsert_provider(pool: &DbPool, provider: &ProviderDescriptor) -> rusqlite::Result<()> {
	let conn = pool.get().expect("catalog connection pool exhausted");
	conn.execute(
		"INSERT INTO upstream_provider (id, provider_type, base_url, api_key, provider_fee_multiplier) \
		 VALUES (?1, ?2, ?3, ?4, ?5) \
		 ON CONFLICT(id) DO UPDATE SET \
		   provider_type = excluded.provider_type, base_url = excluded.base_url, \
		   api_key = excluded.api_key, provider_fee_multiplier = excluded.provider_fee_multiplier",
		rusqlite::params![
			provider.id,
			provider.provider_type,
			provider.base_url,
			provider.api_key,
			provider.provider_fee_multiplier,
		],
	)?;
	Ok(())
}

pub(crate) fn lookup_setting(pool: &DbPool, key: &str) -> rusqlite::Result<Option<String>> {
	let conn = pool.get().expect("catalog connection pool exhausted");
	conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0)).optional()
}
