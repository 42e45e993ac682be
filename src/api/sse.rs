// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Incremental SSE framing parser (spec §4.7 STREAMING, §8 "Streaming
//! settlement"): consumes chunks as they arrive and retains only the last
//! observed `usage` object. Runs as a tee alongside byte-forwarding, never
//! owning the bytes it inspects.

use serde::Deserialize;

use crate::cost::Usage;

#[derive(Debug, Deserialize)]
struct SseEventBody {
	#[serde(default)]
	usage: Option<Usage>,
}

/// Buffers partial lines across chunk boundaries and extracts the last
/// `usage` object seen in any `data: …` frame.
#[derive(Default)]
pub(crate) struct SseUsageTee {
	carry: String,
	last_usage: Option<Usage>,
}

impl SseUsageTee {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Feeds a chunk of bytes. Malformed UTF-8 or malformed JSON lines are
	/// ignored rather than treated as fatal: a single bad event must not
	/// stop settlement from using whatever good data arrived before it.
	pub(crate) fn feed(&mut self, chunk: &[u8]) {
		let text = String::from_utf8_lossy(chunk);
		self.carry.push_str(&text);

		while let Some(newline_at) = self.carry.find('\n') {
			let line: String = self.carry.drain(..=newline_at).collect();
			let line = line.trim_end_matches(['\n', '\r']);
			self.observe_line(line);
		}
	}

	fn observe_line(&mut self, line: &str) {
		let Some(payload) = line.strip_prefix("data:") else { return };
		let payload = payload.trim();
		if payload.is_empty() || payload == "[DONE]" {
			return;
		}
		if let Ok(body) = serde_json::from_str::<SseEventBody>(payload) {
			if let Some(usage) = body.usage {
				self.last_usage = Some(usage);
			}
		}
	}

	/// Call once the stream has ended to flush any unterminated final line.
	/// Takes `&mut self` rather than consuming so a long-lived tee (the
	/// streaming proxy path) can call it from both its normal end-of-stream
	/// branch and, on early cancellation, from `Drop`.
	pub(crate) fn finish(&mut self) -> Option<Usage> {
		if !self.carry.is_empty() {
			let line = std::mem::take(&mut self.carry);
			self.observe_line(line.trim_end_matches(['\n', '\r']));
		}
		self.last_usage.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn captures_usage_from_final_event_across_chunk_boundary() {
		let mut tee = SseUsageTee::new();
		tee.feed(b"data: {\"choices\":[]}\n\n");
		tee.feed(b"data: {\"usage\":{\"prompt_tok");
		tee.feed(b"ens\":10,\"completion_tokens\":5}}\n\n");
		tee.feed(b"data: [DONE]\n\n");

		let usage = tee.finish().unwrap();
		assert_eq!(usage.prompt_tokens, Some(10));
		assert_eq!(usage.completion_tokens, Some(5));
	}

	#[test]
	fn keeps_only_the_last_usage_observed() {
		let mut tee = SseUsageTee::new();
		tee.feed(b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\n");
		tee.feed(b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":9}}\n\n");
		let usage = tee.finish().unwrap();
		assert_eq!(usage.completion_tokens, Some(9));
	}

	#[test]
	fn ignores_malformed_lines_without_losing_prior_usage() {
		let mut tee = SseUsageTee::new();
		tee.feed(b"data: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":3}}\n\n");
		tee.feed(b"data: not json at all\n\n");
		let usage = tee.finish().unwrap();
		assert_eq!(usage.prompt_tokens, Some(2));
	}

	#[test]
	fn no_usage_ever_seen_yields_none() {
		let mut tee = SseUsageTee::new();
		tee.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n");
		assert!(tee.finish().is_none());
	}
}
