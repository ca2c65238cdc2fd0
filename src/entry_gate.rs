//! Entry gate: symbol selection among candidates that already survived
//! price/RR preflight. Covers top-k mode, threshold mode's `effective_gate`
//! formula, and the two ordered fallbacks (pilot trade, exploration trade)
//! that fire when the ordinary gate admits nothing. The selection itself is
//! atomic: once a candidate list is built for a cycle, no symbol is
//! reprocessed after the choice is made.

use crate::config::{EntryGateConfig, ExplorationConfig};
use crate::errors::RejectReason;
use crate::regime::Regime;
use rust_decimal::prelude::*;

#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub symbol: String,
    /// Signed composite score in `[-1.0, 1.0]`.
    pub score: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub rr: Option<f64>,
    pub winning_subsignal: Option<String>,
    pub entry_price: Option<Decimal>,
    /// This symbol's rolling-window statistic (`signals::RollingWindow
    /// ::effective_threshold`), when at least two samples are available.
    /// Threshold mode folds this into the gate per-candidate; `None` falls
    /// back to the caller-supplied floor (fresh symbols, short windows).
    pub effective_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeTier {
    Normal,
    Pilot,
    Exploration,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Admit { symbol: String, tier: SizeTier },
    Skip { symbol: String, reason: RejectReason },
}

impl GateDecision {
    pub fn symbol(&self) -> &str {
        match self {
            GateDecision::Admit { symbol, .. } => symbol,
            GateDecision::Skip { symbol, .. } => symbol,
        }
    }
}

/// Ordinary gate pass: top-k mode if `cfg.enable_top_k`, else threshold mode.
/// `effective_floor` is the regime/risk-on-adjusted `hard_floor_min` the
/// caller has already computed (risk-on may lower it; see `regime::RiskOnState`).
pub fn select_entries(candidates: &[EntryCandidate], cfg: &EntryGateConfig, effective_floor: Decimal) -> Vec<GateDecision> {
    if cfg.enable_top_k {
        select_top_k(candidates, cfg.top_k_entries, effective_floor)
    } else {
        select_threshold(candidates, cfg, effective_floor)
    }
}

fn select_top_k(candidates: &[EntryCandidate], k: usize, floor: Decimal) -> Vec<GateDecision> {
    let floor_f = floor.to_f64().unwrap_or(0.0);
    let mut ranked: Vec<&EntryCandidate> = candidates.iter().filter(|c| c.score.abs() >= floor_f).collect();
    ranked.sort_by(|a, b| b.score.abs().partial_cmp(&a.score.abs()).unwrap());

    let mut decisions = Vec::with_capacity(candidates.len());
    for c in candidates {
        if c.score.abs() < floor_f {
            decisions.push(GateDecision::Skip { symbol: c.symbol.clone(), reason: RejectReason::BelowGateThreshold });
            continue;
        }
        let rank = ranked.iter().position(|r| r.symbol == c.symbol).unwrap();
        if rank < k {
            decisions.push(GateDecision::Admit { symbol: c.symbol.clone(), tier: SizeTier::Normal });
        } else {
            decisions.push(GateDecision::Skip { symbol: c.symbol.clone(), reason: RejectReason::Overflow });
        }
    }
    decisions
}

/// Threshold mode: `effective_gate = max(effective_threshold - gate_margin,
/// hard_floor_min)`, computed per candidate from its own rolling-window
/// statistic (`EntryCandidate::effective_threshold`) when one is available;
/// a candidate with too short a window (or a freshly-seen symbol) falls
/// back to `floor` — the regime/risk-on-adjusted `hard_floor_min` the
/// caller already computed — standing in for `effective_threshold` itself.
fn select_threshold(candidates: &[EntryCandidate], cfg: &EntryGateConfig, floor: Decimal) -> Vec<GateDecision> {
    let hard_floor = cfg.hard_floor_min.to_f64().unwrap_or(0.0);
    let margin = cfg.gate_margin.to_f64().unwrap_or(0.0);
    let default_threshold = floor.to_f64().unwrap_or(0.0);
    candidates
        .iter()
        .map(|c| {
            let threshold = c.effective_threshold.unwrap_or(default_threshold);
            let effective_gate = (threshold - margin).max(hard_floor);
            if c.score.abs() >= effective_gate {
                GateDecision::Admit { symbol: c.symbol.clone(), tier: SizeTier::Normal }
            } else {
                GateDecision::Skip { symbol: c.symbol.clone(), reason: RejectReason::BelowGateThreshold }
            }
        })
        .collect()
}

/// Fires only when `select_entries` admitted nothing. Picks the single best
/// candidate clearing a relaxed score gate and RR bar, sized down by
/// `pilot_multiplier` (applied by the caller during sizing).
pub fn pilot_trade(candidates: &[EntryCandidate], pilot_gate: Decimal, rr_relax_for_pilot: Decimal) -> Option<EntryCandidate> {
    let pilot_gate = pilot_gate.to_f64().unwrap_or(0.0);
    let rr_relax = rr_relax_for_pilot.to_f64().unwrap_or(0.0);
    candidates
        .iter()
        .filter(|c| c.score.abs() >= pilot_gate && c.rr.map(|rr| rr >= rr_relax).unwrap_or(false))
        .max_by(|a, b| a.score.abs().partial_cmp(&b.score.abs()).unwrap())
        .cloned()
}

/// Tracks the daily exploration budget: at most
/// `max_forced_per_day` forced trades, and at most `budget_pct_per_day *
/// equity` notional spent on them. Reset by the orchestrator at the UTC
/// day boundary.
#[derive(Debug, Clone, Default)]
pub struct ExplorationState {
    pub forced_count_today: u32,
    pub used_notional_today: Decimal,
}

impl ExplorationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn budget_remaining(&self, cfg: &ExplorationConfig, equity: Decimal) -> bool {
        self.forced_count_today < cfg.max_forced_per_day && self.used_notional_today < equity * cfg.budget_pct_per_day
    }

    /// Fires only after both the ordinary gate and the pilot trade failed to
    /// admit anything. Forces the single top-scoring candidate regardless of
    /// the normal gate, provided it clears `min_score` and the budget allows.
    pub fn exploration_trade(&mut self, candidates: &[EntryCandidate], cfg: &ExplorationConfig, equity: Decimal, notional_to_spend: Decimal) -> Option<EntryCandidate> {
        if !cfg.enabled || !self.budget_remaining(cfg, equity) {
            return None;
        }
        let min_score = cfg.min_score.to_f64().unwrap_or(0.0);
        let pick = candidates
            .iter()
            .filter(|c| c.score.abs() >= min_score)
            .max_by(|a, b| a.score.abs().partial_cmp(&b.score.abs()).unwrap())
            .cloned();
        if pick.is_some() {
            self.forced_count_today += 1;
            self.used_notional_today += notional_to_spend;
        }
        pick
    }

    pub fn reset_for_new_day(&mut self) {
        self.forced_count_today = 0;
        self.used_notional_today = Decimal::ZERO;
    }
}
