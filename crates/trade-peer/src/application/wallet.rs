//! Balance bookkeeping for trades.
//!
//! A [`Wallet`] tracks two numbers per currency: the stored balance (owned by a
//! [`BalanceStore`]) and the amount reserved by an open offer.  Offers reserve
//! funds so that a user cannot promise the same coins twice; confirming a
//! settled trade moves the stored balance and frees the reservation.
//!
//! All conversions between BTC and USD use the wallet's fixed `rate`.

use thiserror::Error;
use tracing::info;
use trade_core::{Role, Terms};

/// Error type for wallet operations.
#[derive(Debug, Error, PartialEq)]
pub enum WalletError {
    /// The amount text is not a positive number.
    #[error("invalid amount '{0}'")]
    InvalidAmount(String),

    /// Not enough unreserved balance.
    #[error("insufficient {currency}: need {needed}, available {available}")]
    InsufficientFunds {
        currency: &'static str,
        needed: f64,
        available: f64,
    },

    /// The backing store failed.
    #[error("balance store error: {0}")]
    Store(String),
}

/// A BTC/USD balance pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Balances {
    pub btc: f64,
    pub usd: f64,
}

/// Persistent balance storage.
#[cfg_attr(test, mockall::automock)]
pub trait BalanceStore: Send {
    /// Current stored balances.
    fn balances(&self) -> Balances;

    /// Adds the deltas (which may be negative) and returns the new balances.
    fn adjust(&mut self, btc_delta: f64, usd_delta: f64) -> Result<Balances, WalletError>;
}

/// Parses a decimal amount; it must be finite and positive.
pub fn parse_amount(text: &str) -> Result<f64, WalletError> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(WalletError::InvalidAmount(text.to_string())),
    }
}

/// Stored balances plus reservations for open offers.
pub struct Wallet<S: BalanceStore> {
    store: S,
    rate: f64,
    reserved: Balances,
}

impl<S: BalanceStore> Wallet<S> {
    pub fn new(store: S, rate: f64) -> Self {
        Self {
            store,
            rate,
            reserved: Balances::default(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn balances(&self) -> Balances {
        self.store.balances()
    }

    /// Stored balance minus reservations.
    pub fn available(&self) -> Balances {
        let stored = self.store.balances();
        Balances {
            btc: stored.btc - self.reserved.btc,
            usd: stored.usd - self.reserved.usd,
        }
    }

    pub fn reserved(&self) -> Balances {
        self.reserved
    }

    /// Reserves the USD needed to buy `btc`.
    pub fn offer_buy(&mut self, btc: f64) -> Result<(), WalletError> {
        let needed = btc * self.rate;
        let available = self.available().usd;
        if needed > available {
            return Err(WalletError::InsufficientFunds {
                currency: "USD",
                needed,
                available,
            });
        }
        self.reserved.usd += needed;
        Ok(())
    }

    /// Reserves `btc` for sale.
    pub fn offer_sell(&mut self, btc: f64) -> Result<(), WalletError> {
        let available = self.available().btc;
        if btc > available {
            return Err(WalletError::InsufficientFunds {
                currency: "BTC",
                needed: btc,
                available,
            });
        }
        self.reserved.btc += btc;
        Ok(())
    }

    /// Books a completed purchase of `btc`.
    ///
    /// The negotiated amount may differ from the reserved one; the cost must fit
    /// in what is available plus this trade's reservation.
    pub fn confirm_buy(&mut self, btc: f64) -> Result<Balances, WalletError> {
        let cost = btc * self.rate;
        let available = self.available().usd + self.reserved.usd;
        if cost > available {
            return Err(WalletError::InsufficientFunds {
                currency: "USD",
                needed: cost,
                available,
            });
        }
        let balances = self.store.adjust(btc, -cost)?;
        self.reserved.usd = (self.reserved.usd - cost).max(0.0);
        info!("bought BTC{btc} for USD{cost}");
        Ok(balances)
    }

    /// Books a completed sale of `btc`.
    pub fn confirm_sell(&mut self, btc: f64) -> Result<Balances, WalletError> {
        let available = self.available().btc + self.reserved.btc;
        if btc > available {
            return Err(WalletError::InsufficientFunds {
                currency: "BTC",
                needed: btc,
                available,
            });
        }
        let proceeds = btc * self.rate;
        let balances = self.store.adjust(-btc, proceeds)?;
        self.reserved.btc = (self.reserved.btc - btc).max(0.0);
        info!("sold BTC{btc} for USD{proceeds}");
        Ok(balances)
    }

    /// Drops every reservation, e.g. after a rejected or abandoned negotiation.
    pub fn release(&mut self) {
        self.reserved = Balances::default();
    }

    /// Books settled `terms` from the point of view of `role`.
    pub fn settle(&mut self, role: Role, terms: &Terms) -> Result<Balances, WalletError> {
        let btc = parse_amount(&terms.amount)?;
        match role {
            Role::Seller => self.confirm_sell(btc),
            Role::Buyer => self.confirm_buy(btc),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn store_with(btc: f64, usd: f64) -> MockBalanceStore {
        let mut store = MockBalanceStore::new();
        store
            .expect_balances()
            .returning(move || Balances { btc, usd });
        store
    }

    #[test]
    fn test_parse_amount_accepts_positive_decimals() {
        assert_eq!(parse_amount(" 0.25 "), Ok(0.25));
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("").is_err());
    }

    #[test]
    fn test_offer_buy_reserves_usd_at_rate() {
        // Arrange
        let mut wallet = Wallet::new(store_with(0.0, 100_000.0), 49000.0);

        // Act
        wallet.offer_buy(1.0).unwrap();

        // Assert
        assert_eq!(wallet.reserved().usd, 49000.0);
        assert_eq!(wallet.available().usd, 51000.0);
    }

    #[test]
    fn test_offer_buy_beyond_available_fails() {
        let mut wallet = Wallet::new(store_with(0.0, 50_000.0), 49000.0);
        wallet.offer_buy(1.0).unwrap();

        let result = wallet.offer_buy(1.0);

        assert!(matches!(
            result,
            Err(WalletError::InsufficientFunds { currency: "USD", .. })
        ));
        assert_eq!(wallet.reserved().usd, 49000.0);
    }

    #[test]
    fn test_offer_sell_checks_btc() {
        let mut wallet = Wallet::new(store_with(0.5, 0.0), 49000.0);
        assert!(wallet.offer_sell(1.0).is_err());
        assert!(wallet.offer_sell(0.5).is_ok());
        assert_eq!(wallet.available().btc, 0.0);
    }

    #[test]
    fn test_confirm_buy_adjusts_store_and_frees_reservation() {
        // Arrange
        let mut store = store_with(0.0, 100_000.0);
        store
            .expect_adjust()
            .with(eq(1.0), eq(-49000.0))
            .times(1)
            .returning(|_, _| Ok(Balances { btc: 1.0, usd: 51000.0 }));
        let mut wallet = Wallet::new(store, 49000.0);
        wallet.offer_buy(1.0).unwrap();

        // Act
        let after = wallet.confirm_buy(1.0).unwrap();

        // Assert
        assert_eq!(after, Balances { btc: 1.0, usd: 51000.0 });
        assert_eq!(wallet.reserved(), Balances::default());
    }

    #[test]
    fn test_settle_as_seller_confirms_sale() {
        let mut store = store_with(2.0, 0.0);
        store
            .expect_adjust()
            .with(eq(-0.5), eq(24500.0))
            .times(1)
            .returning(|_, _| Ok(Balances { btc: 1.5, usd: 24500.0 }));
        let mut wallet = Wallet::new(store, 49000.0);

        let after = wallet
            .settle(Role::Seller, &Terms::new("48000", "0.5"))
            .unwrap();

        assert_eq!(after.btc, 1.5);
    }

    #[test]
    fn test_settling_more_than_the_balance_is_refused() {
        // Arrange: a counter raised the amount past what the buyer can pay.
        let mut wallet = Wallet::new(store_with(0.0, 60_000.0), 49000.0);
        wallet.offer_buy(1.0).unwrap();

        // Act
        let result = wallet.settle(Role::Buyer, &Terms::new("49000", "2"));

        // Assert: no adjust expectation, so the store is never touched.
        assert!(matches!(
            result,
            Err(WalletError::InsufficientFunds { currency: "USD", .. })
        ));
        assert_eq!(wallet.reserved().usd, 49000.0);
    }

    #[test]
    fn test_selling_more_than_held_is_refused() {
        let mut wallet = Wallet::new(store_with(1.0, 0.0), 49000.0);
        wallet.offer_sell(1.0).unwrap();

        let result = wallet.confirm_sell(1.5);

        assert!(matches!(
            result,
            Err(WalletError::InsufficientFunds { currency: "BTC", .. })
        ));
    }

    #[test]
    fn test_store_failure_keeps_reservation() {
        let mut store = store_with(0.0, 100_000.0);
        store
            .expect_adjust()
            .returning(|_, _| Err(WalletError::Store("disk full".to_string())));
        let mut wallet = Wallet::new(store, 49000.0);
        wallet.offer_buy(1.0).unwrap();

        assert!(wallet.confirm_buy(1.0).is_err());
        assert_eq!(wallet.reserved().usd, 49000.0);
    }

    #[test]
    fn test_release_clears_reservations() {
        let mut wallet = Wallet::new(store_with(1.0, 49000.0), 49000.0);
        wallet.offer_sell(1.0).unwrap();
        wallet.offer_buy(1.0).unwrap();

        wallet.release();

        assert_eq!(wallet.available(), Balances { btc: 1.0, usd: 49000.0 });
    }
}
