// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The wallet primitive contract (spec §6): an external collaborator this
//! crate only consumes. `WalletPrimitive` is the minimal trait the rest of
//! the engine depends on, so no module outside this one needs to know which
//! ecash library actually backs it.

pub(crate) mod cashu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unit {
	Sat,
	Msat,
}

impl Unit {
	pub(crate) fn as_str(self) -> &'static str {
		match self {
			Unit::Sat => "sat",
			Unit::Msat => "msat",
		}
	}

	pub(crate) fn parse(s: &str) -> Self {
		if s.eq_ignore_ascii_case("sat") {
			Unit::Sat
		} else {
			Unit::Msat
		}
	}

	pub(crate) fn to_msat(self, amount: i64) -> i64 {
		match self {
			Unit::Sat => amount * 1000,
			Unit::Msat => amount,
		}
	}

	pub(crate) fn from_msat(self, amount_msat: i64) -> i64 {
		match self {
			Unit::Sat => amount_msat / 1000,
			Unit::Msat => amount_msat,
		}
	}
}

#[derive(Debug, Clone)]
pub(crate) struct Redeemed {
	pub(crate) amount_msat: i64,
	pub(crate) unit: Unit,
	pub(crate) mint: String,
}

#[derive(Debug, Clone)]
pub(crate) enum WalletError {
	AlreadySpent,
	Invalid,
	MintError(String),
}

#[async_trait::async_trait]
pub(crate) trait WalletPrimitive: Send + Sync {
	/// `receive(token) -> (amount, unit, mint) | error`.
	async fn receive(&self, token: &str) -> Result<Redeemed, WalletError>;

	/// `send(amount, unit, mint) -> token | error`.
	async fn send(&self, amount: i64, unit: Unit, mint: &str) -> Result<String, WalletError>;

	/// `send_to_address(amount, unit, mint, address) -> () | error`.
	async fn send_to_address(
		&self, amount: i64, unit: Unit, mint: &str, address: &str,
	) -> Result<(), WalletError>;
}
