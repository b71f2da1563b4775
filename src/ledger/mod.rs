//! Decision ledger: the audit record of every decision and order.
//!
//! Enforces idempotent decision ids and at-most-one open position per
//! (symbol, side), and serves time-range/minimum-confidence queries for the
//! audit sink. Bounded retention: this is an audit window, not long-term
//! persistence.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Decision, DecisionStatus, Order, PositionSide};
use crate::error::RejectReason;

/// A decision plus its terminal outcome, as emitted to the audit sink.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub status: DecisionStatus,
    pub recorded_at: DateTime<Utc>,
}

/// An order plus its integrity hash at record time.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub order: Order,
    pub integrity_hash: String,
    pub recorded_at: DateTime<Utc>,
}

pub struct DecisionLedger {
    decisions: RwLock<VecDeque<DecisionRecord>>,
    orders: RwLock<VecDeque<OrderRecord>>,
    seen_decision_ids: DashSet<Uuid>,
    /// Open interest index: at most one entry per (symbol, side).
    open_positions: DashMap<(String, PositionSide), Uuid>,
    max_records: usize,
}

impl DecisionLedger {
    pub fn new(max_records: usize) -> Self {
        Self {
            decisions: RwLock::new(VecDeque::new()),
            orders: RwLock::new(VecDeque::new()),
            seen_decision_ids: DashSet::new(),
            open_positions: DashMap::new(),
            max_records,
        }
    }

    /// Record a decision with its terminal status. Recording an already-seen
    /// decision id is a no-op, so replayed signals never duplicate.
    pub async fn record_decision(&self, decision: &Decision, status: DecisionStatus) -> bool {
        if !self.seen_decision_ids.insert(decision.decision_id) {
            debug!(decision_id = %decision.decision_id, "duplicate decision id ignored");
            return false;
        }
        let mut decisions = self.decisions.write().await;
        if decisions.len() >= self.max_records {
            decisions.pop_front();
        }
        decisions.push_back(DecisionRecord {
            decision: decision.clone(),
            status,
            recorded_at: Utc::now(),
        });
        true
    }

    pub async fn record_order(&self, order: &Order) {
        let mut orders = self.orders.write().await;
        if orders.len() >= self.max_records {
            orders.pop_front();
        }
        orders.push_back(OrderRecord {
            integrity_hash: order.integrity_hash(),
            order: order.clone(),
            recorded_at: Utc::now(),
        });
    }

    /// Claim the (symbol, side) open slot before submission. Refused while
    /// another order/position on the same key is still open. This is the
    /// at-most-one-open-position guarantee.
    pub fn try_claim_open(
        &self,
        symbol: &str,
        side: PositionSide,
        decision_id: Uuid,
    ) -> Result<(), RejectReason> {
        let key = (symbol.to_string(), side);
        match self.open_positions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RejectReason::DuplicatePosition {
                    symbol: symbol.to_string(),
                    side: side.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(decision_id);
                Ok(())
            }
        }
    }

    /// Release the open slot after a close fill or a failed entry.
    pub fn release_open(&self, symbol: &str, side: PositionSide) {
        if self
            .open_positions
            .remove(&(symbol.to_string(), side))
            .is_none()
        {
            warn!(%symbol, %side, "release of an unclaimed open slot");
        }
    }

    pub fn open_position_count(&self) -> u32 {
        self.open_positions.len() as u32
    }

    pub fn is_open(&self, symbol: &str, side: PositionSide) -> bool {
        self.open_positions
            .contains_key(&(symbol.to_string(), side))
    }

    /// Audit query: decisions within a time range at or above a minimum
    /// confidence, newest first.
    pub async fn query_decisions(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        min_confidence: Option<f64>,
    ) -> Vec<DecisionRecord> {
        let decisions = self.decisions.read().await;
        decisions
            .iter()
            .rev()
            .filter(|r| since.map_or(true, |s| r.decision.generated_at >= s))
            .filter(|r| until.map_or(true, |u| r.decision.generated_at <= u))
            .filter(|r| min_confidence.map_or(true, |m| r.decision.confidence >= m))
            .cloned()
            .collect()
    }

    pub async fn recent_orders(&self, limit: usize) -> Vec<OrderRecord> {
        let orders = self.orders.read().await;
        orders.iter().rev().take(limit).cloned().collect()
    }

    pub async fn decision_count(&self) -> usize {
        self.decisions.read().await.len()
    }
}
