use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::order::TimeInForce;

/// Asset class: drives fractional support and broker time-in-force rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Crypto,
    Equity,
}

impl AssetClass {
    /// Some brokers require GTC on crypto and default to day orders on
    /// equities. Applied at the broker boundary.
    pub fn time_in_force(&self) -> TimeInForce {
        match self {
            AssetClass::Crypto => TimeInForce::GTC,
            AssetClass::Equity => TimeInForce::Day,
        }
    }
}

/// Instrument metadata consumed by the position sizer and execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Canonical symbol, e.g. "BTC/USD" or "AAPL".
    pub symbol: String,
    pub class: AssetClass,
    /// Whether fractional quantities are supported.
    pub fractional: bool,
    /// Decimal places for quantity rounding on fractional instruments.
    pub quantity_precision: u32,
    /// Smallest tradable quantity.
    pub min_quantity: Decimal,
    /// Minimum order notional value accepted by the venue.
    pub min_order_value: Decimal,
}

impl Instrument {
    pub fn crypto(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            class: AssetClass::Crypto,
            fractional: true,
            quantity_precision: 4,
            min_quantity: dec!(0.0001),
            min_order_value: dec!(10),
        }
    }

    pub fn equity(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            class: AssetClass::Equity,
            fractional: false,
            quantity_precision: 0,
            min_quantity: Decimal::ONE,
            min_order_value: Decimal::ONE,
        }
    }

    /// Venue-specific symbol form, e.g. "BTC/USD" → "BTCUSD". Applied
    /// immediately before submission.
    pub fn venue_symbol(&self) -> String {
        self.symbol.replace('/', "")
    }
}

/// Fixed catalog of tradable instruments, registered at process start.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCatalog {
    by_symbol: HashMap<String, Instrument>,
    by_venue: HashMap<String, String>,
}

impl InstrumentCatalog {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let mut by_symbol = HashMap::new();
        let mut by_venue = HashMap::new();
        for instrument in instruments {
            by_venue.insert(instrument.venue_symbol(), instrument.symbol.clone());
            by_symbol.insert(instrument.symbol.clone(), instrument);
        }
        Self { by_symbol, by_venue }
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.by_symbol.get(symbol)
    }

    /// Reverse venue mapping so broker-side records can be tied back to
    /// canonical symbols for internal bookkeeping.
    pub fn canonical_for_venue(&self, venue_symbol: &str) -> Option<&str> {
        self.by_venue.get(venue_symbol).map(String::as_str)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.by_symbol.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
