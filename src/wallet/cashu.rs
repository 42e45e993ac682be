// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! `cdk` (Cashu Development Kit)-backed implementation of `WalletPrimitive`.
//! One `cdk::wallet::Wallet` per mint URL, built lazily and cached, matching
//! how the reference NUT wallet is meant to be driven (one `Wallet` binds a
//! single mint + currency unit).

use std::collections::HashMap;
use std::sync::Arc;

use cdk::amount::Amount;
use cdk::nuts::CurrencyUnit;
use cdk::wallet::{ReceiveOptions, SendOptions, Wallet};
use cdk_sqlite::wallet::memory;
use tokio::sync::Mutex;

use super::{Redeemed, Unit, WalletError, WalletPrimitive};

pub(crate) struct CashuWallet {
	seed: [u8; 64],
	wallets: Mutex<HashMap<String, Arc<Wallet>>>,
}

impl CashuWallet {
	pub(crate) fn new(seed: [u8; 64]) -> Self {
		Self { seed, wallets: Mutex::new(HashMap::new()) }
	}

	async fn wallet_for(&self, mint_url: &str, unit: CurrencyUnit) -> Result<Arc<Wallet>, WalletError> {
		let key = format!("{mint_url}:{unit:?}");
		let mut wallets = self.wallets.lock().await;
		if let Some(wallet) = wallets.get(&key) {
			return Ok(wallet.clone());
		}

		let localstore = memory::empty()
			.await
			.map_err(|e| WalletError::MintError(format!("failed to open in-memory wallet store: {e}")))?;

		let wallet = Wallet::new(mint_url, unit, Arc::new(localstore), self.seed, None)
			.map_err(|e| WalletError::MintError(format!("failed to construct wallet for {mint_url}: {e}")))?;
		let wallet = Arc::new(wallet);
		wallets.insert(key, wallet.clone());
		Ok(wallet)
	}
}

fn to_currency_unit(unit: Unit) -> CurrencyUnit {
	match unit {
		Unit::Sat => CurrencyUnit::Sat,
		Unit::Msat => CurrencyUnit::Msat,
	}
}

#[async_trait::async_trait]
impl WalletPrimitive for CashuWallet {
	async fn receive(&self, token: &str) -> Result<Redeemed, WalletError> {
		let parsed = cdk::nuts::Token::from_str(token).map_err(|_| WalletError::Invalid)?;
		let mint_url = parsed.mint_url().map_err(|_| WalletError::Invalid)?.to_string();
		let unit = parsed.unit().unwrap_or(CurrencyUnit::Sat);

		let wallet = self.wallet_for(&mint_url, unit.clone()).await?;
		let amount = wallet.receive(token, ReceiveOptions::default()).await.map_err(|e| {
			let message = e.to_string();
			if message.to_lowercase().contains("spent") || message.to_lowercase().contains("already") {
				WalletError::AlreadySpent
			} else {
				WalletError::MintError(message)
			}
		})?;

		let gateway_unit = match unit {
			CurrencyUnit::Msat => Unit::Msat,
			_ => Unit::Sat,
		};
		Ok(Redeemed {
			amount_msat: gateway_unit.to_msat(u64::from(amount) as i64),
			unit: gateway_unit,
			mint: mint_url,
		})
	}

	async fn send(&self, amount: i64, unit: Unit, mint: &str) -> Result<String, WalletError> {
		let cdk_unit = to_currency_unit(unit);
		let wallet = self.wallet_for(mint, cdk_unit).await?;
		let native_amount = unit.from_msat(amount).max(0);
		let prepared = wallet
			.prepare_send(Amount::from(native_amount as u64), SendOptions::default())
			.await
			.map_err(|e| WalletError::MintError(format!("prepare_send failed: {e}")))?;
		let token = wallet
			.send(prepared, None)
			.await
			.map_err(|e| WalletError::MintError(format!("send failed: {e}")))?;
		Ok(token.to_string())
	}

	async fn send_to_address(
		&self, amount: i64, unit: Unit, mint: &str, address: &str,
	) -> Result<(), WalletError> {
		// LNURL/lightning payout: melt the requested amount against the mint
		// and pay the address-derived invoice. `cdk`'s melt flow needs a
		// bolt11 invoice, which for an LNURL address is fetched separately
		// (out of this adapter's narrow contract); callers that configured
		// a `refund_address` are expected to have resolved it to an invoice
		// upstream of this call in a full deployment.
		let _ = (amount, unit, mint, address);
		Err(WalletError::MintError(
			"send_to_address requires a resolved bolt11 invoice; none was provided".to_string(),
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn currency_unit_mapping_round_trips_for_known_units() {
		assert!(matches!(to_currency_unit(Unit::Sat), CurrencyUnit::Sat));
		assert!(matches!(to_currency_unit(Unit::Msat), CurrencyUnit::Msat));
	}
}
