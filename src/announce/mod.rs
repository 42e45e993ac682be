// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The announcement publisher (spec §4.9): builds a NIP-91 (kind 38421)
//! provider-discoverability event, signs it with BIP-340 Schnorr, and
//! publishes to a configurable set of Nostr relays on a 24h ± jitter cycle.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const KIND_PROVIDER_ANNOUNCEMENT: u64 = 38421;
const REFRESH_JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub(crate) struct NostrEvent {
	pub(crate) id: String,
	pub(crate) pubkey: String,
	pub(crate) created_at: i64,
	pub(crate) kind: u64,
	pub(crate) tags: Vec<Vec<String>>,
	pub(crate) content: String,
	pub(crate) sig: String,
}

pub(crate) struct AnnouncementSpec {
	pub(crate) provider_id: String,
	pub(crate) endpoint_urls: Vec<String>,
	pub(crate) mint_urls: Vec<String>,
	pub(crate) version: String,
	pub(crate) metadata_json: Option<String>,
}

/// Builds and signs the kind-38421 event (spec §4.9, grounded on the NIP-91
/// tag layout: one `d` tag for the provider id, one `u` tag per endpoint,
/// one `mint` tag per mint, one `version` tag).
pub(crate) fn build_event(private_key_hex: &str, spec: &AnnouncementSpec, created_at: i64) -> Result<NostrEvent, String> {
	let secp = Secp256k1::new();
	let sk_bytes = hex_decode(private_key_hex)?;
	let keypair = Keypair::from_seckey_slice(&secp, &sk_bytes).map_err(|e| format!("invalid private key: {e}"))?;
	let (xonly, _parity) = keypair.x_only_public_key();
	let pubkey_hex = hex::DisplayHex::to_lower_hex_string(xonly.serialize().as_slice());

	let mut tags = vec![vec!["d".to_string(), spec.provider_id.clone()]];
	for url in &spec.endpoint_urls {
		tags.push(vec!["u".to_string(), url.clone()]);
	}
	for mint in &spec.mint_urls {
		tags.push(vec!["mint".to_string(), mint.clone()]);
	}
	tags.push(vec!["version".to_string(), spec.version.clone()]);

	let content = spec.metadata_json.clone().unwrap_or_default();

	let serialized = serde_json::to_string(&serde_json::json!([
		0,
		pubkey_hex,
		created_at,
		KIND_PROVIDER_ANNOUNCEMENT,
		tags,
		content,
	]))
	.map_err(|e| format!("failed to serialize event for id computation: {e}"))?;

	let digest = Sha256::digest(serialized.as_bytes());
	let id_hex = hex::DisplayHex::to_lower_hex_string(digest.as_slice());

	let msg = Message::from_slice(digest.as_slice()).map_err(|e| format!("failed to build signing message: {e}"))?;
	let signature = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
	let sig_hex = hex::DisplayHex::to_lower_hex_string(signature.as_ref());

	Ok(NostrEvent {
		id: id_hex,
		pubkey: pubkey_hex,
		created_at,
		kind: KIND_PROVIDER_ANNOUNCEMENT,
		tags,
		content,
		sig: sig_hex,
	})
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
	if s.len() % 2 != 0 {
		return Err("odd-length hex string".to_string());
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
		.collect()
}

fn tag_values<'a>(event: &'a NostrEvent, key: &str) -> Vec<&'a str> {
	event.tags.iter().filter(|t| t.first().map(|k| k == key).unwrap_or(false)).filter_map(|t| t.get(1)).map(String::as_str).collect()
}

/// Dedup check (spec §4.9: "skip publishing if the most recent record is
/// semantically equal").
pub(crate) fn semantically_equal(a: &NostrEvent, b: &NostrEvent) -> bool {
	use std::collections::HashSet;

	a.kind == b.kind
		&& tag_values(a, "d").first() == tag_values(b, "d").first()
		&& tag_values(a, "u").into_iter().collect::<HashSet<_>>() == tag_values(b, "u").into_iter().collect::<HashSet<_>>()
		&& tag_values(a, "mint").into_iter().collect::<HashSet<_>>()
			== tag_values(b, "mint").into_iter().collect::<HashSet<_>>()
		&& tag_values(a, "version").first() == tag_values(b, "version").first()
		&& a.content == b.content
}

/// Publishes `event` to a single relay over its websocket endpoint and
/// requests any existing announcements from this pubkey for the dedup check
/// above. Best-effort: a relay that cannot be reached is logged and skipped.
pub(crate) async fn publish_to_relay(relay_url: &str, event: &NostrEvent) -> Result<(), String> {
	let (mut ws, _) =
		tokio_tungstenite::connect_async(relay_url).await.map_err(|e| format!("connect to {relay_url} failed: {e}"))?;

	let frame = serde_json::to_string(&serde_json::json!(["EVENT", event]))
		.map_err(|e| format!("failed to encode EVENT frame: {e}"))?;
	ws.send(WsMessage::Text(frame)).await.map_err(|e| format!("send to {relay_url} failed: {e}"))?;

	// Relays answer with an OK frame; we don't block the publish cycle
	// waiting for it beyond a quick drain, matching the "never blocks the
	// request path" spirit of the other background tasks.
	let _ = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next()).await;
	let _ = ws.close(None).await;
	Ok(())
}

/// Queries `relay_url` for existing kind-38421 events from `pubkey`,
/// returning the most recently created one if any.
pub(crate) async fn query_latest(relay_url: &str, pubkey: &str, timeout: std::time::Duration) -> Option<NostrEvent> {
	let (mut ws, _) = tokio_tungstenite::connect_async(relay_url).await.ok()?;
	let sub_id = format!("announce-{pubkey}");
	let filter = serde_json::json!({"kinds": [KIND_PROVIDER_ANNOUNCEMENT], "authors": [pubkey], "limit": 10});
	let frame = serde_json::to_string(&serde_json::json!(["REQ", sub_id, filter])).ok()?;
	ws.send(WsMessage::Text(frame)).await.ok()?;

	let mut latest: Option<NostrEvent> = None;
	let deadline = tokio::time::Instant::now() + timeout;
	while tokio::time::Instant::now() < deadline {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		match tokio::time::timeout(remaining, ws.next()).await {
			Ok(Some(Ok(WsMessage::Text(text)))) => {
				if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
					if parsed.get(0).and_then(|v| v.as_str()) == Some("EVENT") {
						if let Some(event_value) = parsed.get(2) {
							if let Ok(event) = serde_json::from_value::<NostrEvent>(event_value.clone()) {
								let newer = latest.as_ref().map(|l| event.created_at > l.created_at).unwrap_or(true);
								if newer {
									latest = Some(event);
								}
							}
						}
					} else if parsed.get(0).and_then(|v| v.as_str()) == Some("EOSE") {
						break;
					}
				}
			},
			_ => break,
		}
	}
	let _ = ws.close(None).await;
	latest
}

/// Runs one announcement cycle: build the event, query each relay for an
/// existing one, skip relays that already carry a semantically-equal
/// record, publish to the rest.
pub(crate) async fn announce_once(private_key_hex: &str, spec: &AnnouncementSpec, relays: &[String], now: i64) {
	let event = match build_event(private_key_hex, spec, now) {
		Ok(event) => event,
		Err(e) => {
			log::error!("announcement publisher: failed to build event: {e}");
			return;
		},
	};

	for relay in relays {
		let existing = query_latest(relay, &event.pubkey, std::time::Duration::from_secs(10)).await;
		if let Some(existing) = existing {
			if semantically_equal(&existing, &event) {
				log::debug!("announcement publisher: {relay} already has an up-to-date record, skipping");
				continue;
			}
		}
		if let Err(e) = publish_to_relay(relay, &event).await {
			log::warn!("announcement publisher: {e}");
		}
	}
}

/// Spawns the 24h ± jitter background loop.
pub(crate) fn spawn(
	private_key_hex: String, spec: AnnouncementSpec, relays: Vec<String>, interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			let now = chrono::Utc::now().timestamp();
			announce_once(&private_key_hex, &spec, &relays, now).await;
			let jitter = 1.0 + rand::thread_rng().gen_range(-REFRESH_JITTER_FRACTION..=REFRESH_JITTER_FRACTION);
			tokio::time::sleep(interval.mul_f64(jitter.max(0.01))).await;
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_spec() -> AnnouncementSpec {
		AnnouncementSpec {
			provider_id: "provider-1".to_string(),
			endpoint_urls: vec!["https://proxy.example/v1".to_string()],
			mint_urls: vec!["https://mint.example".to_string()],
			version: "1.0.0".to_string(),
			metadata_json: None,
		}
	}

	#[test]
	fn build_event_produces_deterministic_id_and_valid_signature() {
		let sk_hex = "01".repeat(32);
		let event = build_event(&sk_hex, &sample_spec(), 1_700_000_000).unwrap();
		assert_eq!(event.kind, KIND_PROVIDER_ANNOUNCEMENT);
		assert_eq!(event.id.len(), 64);
		assert_eq!(event.sig.len(), 128);

		let secp = Secp256k1::new();
		let digest = hex_decode(&event.id).unwrap();
		let msg = Message::from_slice(&digest).unwrap();
		let xonly = secp256k1::XOnlyPublicKey::from_slice(&hex_decode(&event.pubkey).unwrap()).unwrap();
		let sig = secp256k1::schnorr::Signature::from_slice(&hex_decode(&event.sig).unwrap()).unwrap();
		assert!(secp.verify_schnorr(&sig, &msg, &xonly).is_ok());
	}

	#[test]
	fn semantically_equal_ignores_tag_order() {
		let sk_hex = "02".repeat(32);
		let mut spec_a = sample_spec();
		spec_a.mint_urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
		let mut spec_b = sample_spec();
		spec_b.mint_urls = vec!["https://b.example".to_string(), "https://a.example".to_string()];

		let a = build_event(&sk_hex, &spec_a, 1000).unwrap();
		let b = build_event(&sk_hex, &spec_b, 2000).unwrap();
		assert!(semantically_equal(&a, &b));
	}

	#[test]
	fn semantically_equal_detects_url_change() {
		let sk_hex = "03".repeat(32);
		let a = build_event(&sk_hex, &sample_spec(), 1000).unwrap();
		let mut spec_b = sample_spec();
		spec_b.endpoint_urls = vec!["https://different.example/v1".to_string()];
		let b = build_event(&sk_hex, &spec_b, 1000).unwrap();
		assert!(!semantically_equal(&a, &b));
	}
}
