//! Position sizing: converts an accepted decision plus an account snapshot
//! into an order quantity bounded by the active limit profile, or a
//! machine-readable rejection.

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::config::SizingConfig;
use crate::domain::{AccountSnapshot, Decision, Instrument, PositionSide};
use crate::error::RejectReason;
use crate::risk::{RiskLimits, RiskSnapshot};

/// The sizer's accepted output: either a fresh entry or a close of the
/// opposing position.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub quantity: Decimal,
    pub side: PositionSide,
    /// True when this order closes an existing opposite-side position. A
    /// close uses the existing position quantity and carries no protective
    /// orders of its own.
    pub closes_position: bool,
}

pub struct PositionSizer {
    config: SizingConfig,
    limits: RiskLimits,
    decision_max_age_secs: u64,
}

impl PositionSizer {
    pub fn new(config: SizingConfig, limits: RiskLimits, decision_max_age_secs: u64) -> Self {
        Self {
            config,
            limits,
            decision_max_age_secs,
        }
    }

    /// Size a decision against the current account and instrument metadata.
    ///
    /// `open_position_count` counts open positions across all symbols;
    /// `recent_volatility` is the symbol's realized volatility, used for
    /// downward scaling only.
    pub fn size(
        &self,
        decision: &Decision,
        account: &AccountSnapshot,
        instrument: &Instrument,
        risk: &RiskSnapshot,
        open_position_count: u32,
        recent_volatility: Option<f64>,
    ) -> Result<SizedOrder, RejectReason> {
        // Gating checks first: each rejection carries its specific reason.
        if decision.is_expired(self.decision_max_age_secs, Utc::now()) {
            return Err(RejectReason::StaleDecision {
                max_age_secs: self.decision_max_age_secs,
            });
        }

        if risk.trading_halted {
            let reason = risk
                .halt_reason
                .clone()
                .unwrap_or_else(|| "risk halted".to_string());
            return Err(RejectReason::RiskHalted(reason));
        }

        if !self.limits.is_symbol_allowed(&decision.symbol) {
            return Err(RejectReason::InstrumentNotPermitted(decision.symbol.clone()));
        }

        let minimum = self.limits.min_confidence_for(decision.contributing_sources);
        if decision.confidence < minimum {
            return Err(RejectReason::InsufficientConfidence {
                confidence: decision.confidence,
                minimum,
                sources: decision.contributing_sources,
            });
        }

        let side = PositionSide::try_from(decision.direction)
            .map_err(|_| RejectReason::QuantityRoundedToZero {
                price: decision.entry_price.to_string(),
            })?;

        // An opposite-side position must be closed first; sizing a close
        // uses the existing quantity, never a freshly computed one.
        if let Some(position) = account.position_for(&decision.symbol) {
            if position.side == side {
                return Err(RejectReason::DuplicatePosition {
                    symbol: decision.symbol.clone(),
                    side: side.to_string(),
                });
            }
            debug!(
                symbol = %decision.symbol,
                quantity = %position.quantity,
                "opposite-side position open; sizing a close"
            );
            return Ok(SizedOrder {
                quantity: position.quantity,
                side: position.side,
                closes_position: true,
            });
        }

        if open_position_count >= self.limits.max_open_positions {
            return Err(RejectReason::TooManyOpenPositions {
                current: open_position_count,
                limit: self.limits.max_open_positions,
            });
        }

        let quantity = self.compute_entry_quantity(decision, account, instrument)?;
        let scaled = self.apply_scaling(quantity, decision.confidence, recent_volatility);
        let rounded = self.round_quantity(scaled, instrument, decision.entry_price)?;
        let final_quantity =
            self.enforce_min_notional(rounded, decision.entry_price, account, instrument)?;

        Ok(SizedOrder {
            quantity: final_quantity,
            side,
            closes_position: false,
        })
    }

    /// Base quantity: configured buying-power fraction, capped by the
    /// profile's ceiling.
    fn compute_entry_quantity(
        &self,
        decision: &Decision,
        account: &AccountSnapshot,
        _instrument: &Instrument,
    ) -> Result<Decimal, RejectReason> {
        if decision.entry_price <= Decimal::ZERO {
            return Err(RejectReason::QuantityRoundedToZero {
                price: decision.entry_price.to_string(),
            });
        }
        let pct = self
            .config
            .position_size_pct
            .min(self.limits.max_position_size_pct);
        Ok(account.buying_power * pct / decision.entry_price)
    }

    /// Confidence scales size up past the threshold; recent volatility above
    /// target scales it down, floored so sizing never collapses entirely on
    /// a noisy tape.
    fn apply_scaling(
        &self,
        quantity: Decimal,
        confidence: f64,
        recent_volatility: Option<f64>,
    ) -> Decimal {
        let mut scale = 1.0_f64;
        if confidence >= self.config.high_confidence_threshold {
            scale *= 1.0 + self.config.high_confidence_boost;
        }
        if let Some(vol) = recent_volatility {
            if vol > self.config.target_volatility && vol > 0.0 {
                let vol_scale =
                    (self.config.target_volatility / vol).max(self.config.min_volatility_scale);
                scale *= vol_scale;
            }
        }
        quantity * Decimal::from_f64(scale).unwrap_or(Decimal::ONE)
    }

    /// Fractional instruments round down to the configured precision with a
    /// nonzero floor; whole-unit instruments floor to an integer with a
    /// minimum of one unit.
    fn round_quantity(
        &self,
        quantity: Decimal,
        instrument: &Instrument,
        price: Decimal,
    ) -> Result<Decimal, RejectReason> {
        let rounded = if instrument.fractional {
            quantity.round_dp_with_strategy(
                instrument.quantity_precision,
                RoundingStrategy::ToZero,
            )
        } else {
            quantity.trunc()
        };

        if rounded < instrument.min_quantity {
            // The minimum floor applies before giving up: a tiny allocation
            // on an expensive instrument sizes to the floor, not to zero.
            let floor_notional = instrument.min_quantity * price;
            if floor_notional <= Decimal::ZERO {
                return Err(RejectReason::QuantityRoundedToZero {
                    price: price.to_string(),
                });
            }
            return Ok(instrument.min_quantity);
        }
        Ok(rounded)
    }

    /// Below the venue's minimum order value, raise the quantity just enough
    /// to clear it, unless buying power itself is insufficient, which is a
    /// distinct rejection from rounding to zero.
    fn enforce_min_notional(
        &self,
        quantity: Decimal,
        price: Decimal,
        account: &AccountSnapshot,
        instrument: &Instrument,
    ) -> Result<Decimal, RejectReason> {
        let notional = quantity * price;
        if notional >= instrument.min_order_value {
            if notional > account.buying_power {
                return Err(RejectReason::InsufficientBuyingPower {
                    required: notional.to_string(),
                    available: account.buying_power.to_string(),
                });
            }
            return Ok(quantity);
        }

        if account.buying_power < instrument.min_order_value {
            return Err(RejectReason::InsufficientBuyingPower {
                required: instrument.min_order_value.to_string(),
                available: account.buying_power.to_string(),
            });
        }

        let bumped = if instrument.fractional {
            (instrument.min_order_value / price).round_dp_with_strategy(
                instrument.quantity_precision,
                RoundingStrategy::AwayFromZero,
            )
        } else {
            (instrument.min_order_value / price)
                .round_dp_with_strategy(0, RoundingStrategy::AwayFromZero)
        };
        let bumped = bumped.max(instrument.min_quantity);

        if bumped * price > account.buying_power {
            return Err(RejectReason::InsufficientBuyingPower {
                required: (bumped * price).to_string(),
                available: account.buying_power.to_string(),
            });
        }
        debug!(%quantity, %bumped, "quantity bumped to clear minimum order value");
        Ok(bumped)
    }
}
