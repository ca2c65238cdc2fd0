//! Risk manager: three-tier SL/TP derivation, RR, preflight checks, daily
//! loss-limit halt, and the exit-action builder, expressed as a bag of
//! pure functions over explicit inputs so each is independently testable.

use crate::errors::RejectReason;
use crate::pricing::Side;
use rust_decimal::prelude::*;

const EPS: Decimal = Decimal::from_parts(1, 0, 0, false, 5); // 1e-5

#[derive(Debug, Clone, Copy)]
pub struct StrategyLevels {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Copy)]
pub struct SlTpResult {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub tier: SlTpTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlTpTier {
    Strategy,
    Atr,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct SlTpParams {
    pub atr_k_sl: Decimal,
    pub atr_m_tp: Decimal,
    pub enable_fallback: bool,
    pub fallback_sl_pct: Decimal,
    pub fallback_tp_pct: Decimal,
}

/// Three-tier SL/TP derivation. Tier 3 returns `None` (not a
/// fallback value) when fallback is disabled — the caller must reject the
/// candidate with `no_atr_no_fallback`.
pub fn derive_sl_tp(
    side: Side,
    entry: Decimal,
    strategy: StrategyLevels,
    atr: Option<f64>,
    params: &SlTpParams,
) -> Option<SlTpResult> {
    if let (Some(sl), Some(tp)) = (strategy.stop_loss, strategy.take_profit) {
        return Some(SlTpResult { stop_loss: sl, take_profit: tp, tier: SlTpTier::Strategy });
    }

    if let Some(atr) = atr.filter(|a| *a > 0.0 && a.is_finite()) {
        let atr_dec = Decimal::from_f64(atr)?;
        let sl_dist = params.atr_k_sl * atr_dec;
        let tp_dist = params.atr_m_tp * atr_dec;
        let (sl, tp) = match side {
            Side::Long => (entry - sl_dist, entry + tp_dist),
            Side::Short => (entry + sl_dist, entry - tp_dist),
        };
        return Some(SlTpResult { stop_loss: sl, take_profit: tp, tier: SlTpTier::Atr });
    }

    if params.enable_fallback {
        let (sl, tp) = match side {
            Side::Long => (entry * (Decimal::ONE - params.fallback_sl_pct), entry * (Decimal::ONE + params.fallback_tp_pct)),
            Side::Short => (entry * (Decimal::ONE + params.fallback_sl_pct), entry * (Decimal::ONE - params.fallback_tp_pct)),
        };
        return Some(SlTpResult { stop_loss: sl, take_profit: tp, tier: SlTpTier::Fallback });
    }

    None
}

/// `rr = |tp - entry| / |entry - sl|`. `None` if undefined (sl == entry or
/// any input non-positive).
pub fn compute_rr(entry: Decimal, sl: Decimal, tp: Decimal) -> Option<f64> {
    if entry <= Decimal::ZERO || sl <= Decimal::ZERO || tp <= Decimal::ZERO {
        return None;
    }
    let stop_dist = (entry - sl).abs();
    if stop_dist.is_zero() {
        return None;
    }
    let tp_dist = (tp - entry).abs();
    (tp_dist / stop_dist).to_f64()
}

/// `stop_frac = |entry - sl| / max(entry, eps)`, floored so sizing never
/// divides by (near) zero.
pub fn stop_frac(entry: Decimal, sl: Decimal) -> Decimal {
    let denom = entry.max(EPS);
    ((entry - sl).abs() / denom).max(EPS)
}

#[derive(Debug, Clone, Copy)]
pub struct PreflightInputs {
    pub side: Side,
    pub is_flat: bool,
    pub short_enabled_global: bool,
    pub short_allowed_symbol: bool,
    pub stop_frac: Decimal,
    pub min_stop_frac: Decimal,
    pub rr: Option<f64>,
    pub rr_min: f64,
    pub halt_new_entries_today: bool,
}

/// Runs every preflight gate in order and returns the first failing
/// reason, or `None` if the candidate may proceed to sizing.
pub fn preflight(inputs: &PreflightInputs) -> Option<RejectReason> {
    if inputs.halt_new_entries_today {
        return Some(RejectReason::DailyLossLimitHalt);
    }
    if inputs.side == Side::Short
        && inputs.is_flat
        && !(inputs.short_enabled_global && inputs.short_allowed_symbol)
    {
        return Some(RejectReason::ShortNotAllowed);
    }
    if inputs.stop_frac < inputs.min_stop_frac {
        return Some(RejectReason::InvalidStopDistance);
    }
    match inputs.rr {
        Some(rr) if rr >= inputs.rr_min => None,
        _ => Some(RejectReason::RrTooLow),
    }
}

/// `(session_start_equity - current_equity) / session_start_equity >=
/// daily_loss_limit_pct`.
pub fn daily_loss_limit_breached(session_start_equity: Decimal, current_equity: Decimal, daily_loss_limit_pct: Decimal) -> bool {
    if session_start_equity <= Decimal::ZERO {
        return false;
    }
    let drawdown = (session_start_equity - current_equity) / session_start_equity;
    drawdown >= daily_loss_limit_pct
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    ProfitLadder(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct SuggestedExit {
    pub qty: Decimal,
    pub price_hint: Decimal,
    pub reason: ExitReason,
}

/// Exit-action builder: stop/TP checked first (priority order is enforced
/// by the exit manager that calls this per-position; this function handles
/// one trigger type at a time so the manager can short-circuit on the
/// first hit).
pub fn check_stop_take_profit(side: Side, mark: Decimal, sl: Decimal, tp: Decimal, qty: Decimal) -> Option<SuggestedExit> {
    let stop_hit = match side {
        Side::Long => mark <= sl,
        Side::Short => mark >= sl,
    };
    if stop_hit {
        return Some(SuggestedExit { qty, price_hint: mark, reason: ExitReason::StopLoss });
    }
    let tp_hit = match side {
        Side::Long => mark >= tp,
        Side::Short => mark <= tp,
    };
    if tp_hit {
        return Some(SuggestedExit { qty, price_hint: mark, reason: ExitReason::TakeProfit });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(m: i64, s: u32) -> Decimal {
        Decimal::new(m, s)
    }

    fn default_params() -> SlTpParams {
        SlTpParams {
            atr_k_sl: dec(15, 1),
            atr_m_tp: dec(3, 0),
            enable_fallback: true,
            fallback_sl_pct: dec(2, 2),
            fallback_tp_pct: dec(4, 2),
        }
    }

    #[test]
    fn strategy_levels_take_priority() {
        let r = derive_sl_tp(
            Side::Long,
            dec(50000, 0),
            StrategyLevels { stop_loss: Some(dec(49000, 0)), take_profit: Some(dec(52000, 0)) },
            Some(100.0),
            &default_params(),
        )
        .unwrap();
        assert_eq!(r.tier, SlTpTier::Strategy);
        assert_eq!(r.stop_loss, dec(49000, 0));
    }

    #[test]
    fn atr_tier_used_when_no_strategy_levels() {
        let r = derive_sl_tp(Side::Long, dec(50000, 0), StrategyLevels { stop_loss: None, take_profit: None }, Some(200.0), &default_params()).unwrap();
        assert_eq!(r.tier, SlTpTier::Atr);
        assert_eq!(r.stop_loss, dec(50000, 0) - dec(15, 1) * dec(200, 0));
    }

    #[test]
    fn fallback_rejected_when_disabled_and_no_atr() {
        let mut params = default_params();
        params.enable_fallback = false;
        let r = derive_sl_tp(Side::Long, dec(50000, 0), StrategyLevels { stop_loss: None, take_profit: None }, None, &params);
        assert!(r.is_none());
    }

    #[test]
    fn rr_matches_scenario_two_to_one() {
        let rr = compute_rr(dec(50000, 0), dec(49000, 0), dec(52000, 0)).unwrap();
        assert!((rr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rr_undefined_when_sl_equals_entry() {
        assert!(compute_rr(dec(50000, 0), dec(50000, 0), dec(52000, 0)).is_none());
    }

    #[test]
    fn preflight_rejects_short_from_flat_without_permission() {
        let inputs = PreflightInputs {
            side: Side::Short,
            is_flat: true,
            short_enabled_global: false,
            short_allowed_symbol: true,
            stop_frac: dec(1, 2),
            min_stop_frac: dec(1, 3),
            rr: Some(2.0),
            rr_min: 1.2,
            halt_new_entries_today: false,
        };
        assert_eq!(preflight(&inputs), Some(RejectReason::ShortNotAllowed));
    }

    #[test]
    fn preflight_boundary_stop_frac_passes() {
        let inputs = PreflightInputs {
            side: Side::Long,
            is_flat: true,
            short_enabled_global: false,
            short_allowed_symbol: false,
            stop_frac: dec(1, 3),
            min_stop_frac: dec(1, 3),
            rr: Some(1.2),
            rr_min: 1.2,
            halt_new_entries_today: false,
        };
        assert_eq!(preflight(&inputs), None);
    }

    #[test]
    fn preflight_below_stop_frac_rejects() {
        let inputs = PreflightInputs {
            side: Side::Long,
            is_flat: true,
            short_enabled_global: false,
            short_allowed_symbol: false,
            stop_frac: dec(9, 4),
            min_stop_frac: dec(1, 3),
            rr: Some(2.0),
            rr_min: 1.2,
            halt_new_entries_today: false,
        };
        assert_eq!(preflight(&inputs), Some(RejectReason::InvalidStopDistance));
    }

    #[test]
    fn preflight_short_circuits_on_daily_loss_halt() {
        let inputs = PreflightInputs {
            side: Side::Long,
            is_flat: true,
            short_enabled_global: false,
            short_allowed_symbol: false,
            stop_frac: dec(1, 2),
            min_stop_frac: dec(1, 3),
            rr: Some(2.0),
            rr_min: 1.2,
            halt_new_entries_today: true,
        };
        assert_eq!(preflight(&inputs), Some(RejectReason::DailyLossLimitHalt));
    }

    #[test]
    fn daily_loss_limit_scenario_matches_spec() {
        assert!(daily_loss_limit_breached(dec(10000, 0), dec(9490, 0), dec(5, 2)));
        assert!(!daily_loss_limit_breached(dec(10000, 0), dec(9600, 0), dec(5, 2)));
    }

    #[test]
    fn stop_loss_triggers_before_take_profit_for_long() {
        let exit = check_stop_take_profit(Side::Long, dec(48900, 0), dec(49000, 0), dec(52000, 0), dec(1, 1)).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }
}
