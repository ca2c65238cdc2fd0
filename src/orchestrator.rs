//! Trading system orchestrator: runs the cycle hydrate → snapshot →
//! signals → gate → execute → update → assert → persist, in terms of the
//! typed seams already defined in this crate (`EntryCandidate`,
//! `DecisionTrace`, `FillOutcome`, …) rather than loose dicts.
//!
//! The orchestrator owns its collaborators directly (`DataEngine`,
//! `SignalEngine`, `Connector`, `StateStore`) and drives a whole cycle per
//! call — the only async fan-out lives inside
//! `pricing::CycleContext::create_snapshot`; everything else in this module
//! runs serially.

use crate::config::EngineConfig;
use crate::contracts::{Connector, DataEngine, IndicatorName, SignalEngine};
use crate::decision_trace::{DecisionTrace, FinalAction};
use crate::entry_gate::{self, EntryCandidate, ExplorationState, GateDecision, SizeTier};
use crate::errors::{EngineError, EngineResult};
use crate::exit_manager::{self, LadderState, OpenPosition};
use crate::ledger::TradeLedger;
use crate::order_builder::build_order;
use crate::order_manager::{self, Order, OrderState, OrderType};
use crate::portfolio::{Fill, Portfolio};
use crate::pricing::{CycleContext, Side};
use crate::rate_limit::RateLimiterRegistry;
use crate::regime::{self, Indicators, RegimeReason, RiskOnState};
use crate::risk::{self, ExitReason, PreflightInputs, SlTpParams, StrategyLevels};
use crate::signals::RollingWindow;
use crate::sizing::{plan_slices, target_notional, SizingInputs, SlicingParams};
use crate::store::{CashEquityRow, SignalWindowRow, StateStore};
use rand::Rng;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Key used inside the `session_metadata` JSON blob to persist the taken
/// TP-ladder levels so they survive a restart.
const META_LADDER_KEY: &str = "tp_ladder_taken";
const META_HALT_KEY: &str = "halt_new_entries_today";
const META_EXPLORATION_COUNT_KEY: &str = "exploration_forced_count_today";
const META_EXPLORATION_NOTIONAL_KEY: &str = "exploration_used_notional_today";
/// UTC calendar day (days since the epoch) the daily-halt flag and the
/// exploration budget were last reset. `run_cycle` compares this against
/// today's day number and resets both when it has rolled over.
const META_DAY_KEY: &str = "halt_day";
const RECONCILIATION_ATTEMPTS: u32 = 3;

fn utc_day(now: chrono::DateTime<chrono::Utc>) -> i64 {
    now.timestamp().div_euclid(86_400)
}

pub struct Orchestrator {
    pub config: EngineConfig,
    pub session_id: String,
    data_engine: Box<dyn DataEngine>,
    signal_engine: Box<dyn SignalEngine>,
    connector: Box<dyn Connector>,
    store: Box<dyn StateStore>,
    portfolio: Portfolio,
    trade_ledger: TradeLedger,
    ladder: LadderState,
    risk_on: RiskOnState,
    exploration: ExplorationState,
    session_start_equity: Decimal,
    halt_new_entries_today: bool,
    halt_day: i64,
    cycle_seq: u64,
    rate_limiter: RateLimiterRegistry,
    /// Per-symbol rolling window of composite scores, the threshold mode's
    /// normalizer input (spec.md §3's "rolling signal window", bounded to
    /// `signals::RollingWindow::DEFAULT_CAPACITY`). Hydrated from
    /// `signal_windows` at startup, appended to and re-persisted each cycle.
    signal_windows: HashMap<String, RollingWindow>,
}

/// Single logical venue name the connector's token bucket is keyed on.
/// This crate drives one exchange connector per orchestrator instance, so
/// there is exactly one bucket in practice; a multi-venue connector would
/// key `acquire` on the venue reported alongside each symbol instead.
const CONNECTOR_VENUE: &str = "connector";

impl Orchestrator {
    /// Step 1, "hydrate": rebuild the portfolio and session flags from the
    /// State Store. A fresh session (nothing persisted yet) starts from
    /// `config.trading.initial_capital`.
    pub async fn hydrate(
        config: EngineConfig,
        session_id: String,
        data_engine: Box<dyn DataEngine>,
        signal_engine: Box<dyn SignalEngine>,
        connector: Box<dyn Connector>,
        mut store: Box<dyn StateStore>,
    ) -> EngineResult<Self> {
        let cash = store.get_cash(&session_id).map_err(EngineError::Store)?;
        let cash = if cash.is_zero() { config.trading.initial_capital } else { cash };

        let positions = store.get_positions(&session_id).map_err(EngineError::Store)?;
        let last_equity = store.last_cash_equity(&session_id).map_err(EngineError::Store)?.map(|r| r.equity);
        let session_start_equity = last_equity.unwrap_or(config.trading.initial_capital);

        let mut portfolio = Portfolio::hydrate(cash, positions.clone(), last_equity);
        for row in &positions {
            let lots = store.load_lots(&session_id, &row.symbol).map_err(EngineError::Store)?;
            for lot in lots {
                portfolio.lot_book.add_lot(&lot.symbol, lot.quantity, lot.price, lot.fee, &lot.trade_id);
            }
        }

        let metadata = store.get_session_metadata(&session_id).map_err(EngineError::Store)?;
        let ladder = metadata
            .get(META_LADDER_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                LadderState::from_pairs(arr.iter().filter_map(|pair| {
                    let pair = pair.as_array()?;
                    let symbol = pair.first()?.as_str()?.to_string();
                    let level = pair.get(1)?.as_u64()? as usize;
                    Some((symbol, level))
                }))
            })
            .unwrap_or_default();
        let halt_new_entries_today = metadata.get(META_HALT_KEY).and_then(|v| v.as_bool()).unwrap_or(false);
        let halt_day = metadata.get(META_DAY_KEY).and_then(|v| v.as_i64()).unwrap_or_else(|| utc_day(chrono::Utc::now()));
        let exploration = ExplorationState {
            forced_count_today: metadata.get(META_EXPLORATION_COUNT_KEY).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            used_notional_today: metadata
                .get(META_EXPLORATION_NOTIONAL_KEY)
                .and_then(|v| v.as_str())
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO),
        };

        let rate_limiter = RateLimiterRegistry::new(config.execution.calls_per_second, config.execution.burst_size);

        let mut signal_windows = HashMap::new();
        for symbol in &config.trading.symbols {
            let values = store.load_signal_window(&session_id, symbol, &config.trading.timeframe, &config.trading.primary_strategy).map_err(EngineError::Store)?;
            let mut window = RollingWindow::new(RollingWindow::DEFAULT_CAPACITY);
            for v in values {
                window.push(v);
            }
            signal_windows.insert(symbol.clone(), window);
        }

        Ok(Self {
            config,
            session_id,
            data_engine,
            signal_engine,
            connector,
            store,
            portfolio,
            trade_ledger: TradeLedger::new(),
            ladder,
            risk_on: RiskOnState::inactive(),
            exploration,
            session_start_equity,
            halt_new_entries_today,
            halt_day,
            cycle_seq: 0,
            rate_limiter,
            signal_windows,
        })
    }

    fn mark_price(&self, ctx: &mut CycleContext, cycle_id: u64, symbol: &str, fallback: Decimal) -> Decimal {
        ctx.get_mark_price(cycle_id, symbol).ok().flatten().unwrap_or(fallback)
    }

    /// Runs exactly one cycle: hydrate (session flags only — the portfolio
    /// is hydrated once at startup), snapshot, signals/regime, entry gate,
    /// execution, portfolio update, post-cycle equity assertion, persist.
    pub async fn run_cycle(&mut self) -> EngineResult<()> {
        self.cycle_seq += 1;
        let cycle_id = self.cycle_seq;
        let mut ctx = CycleContext::new(cycle_id);

        let today = utc_day(chrono::Utc::now());
        if today != self.halt_day {
            self.halt_new_entries_today = false;
            self.exploration.reset_for_new_day();
            self.halt_day = today;
        }

        let symbols = self.config.trading.symbols.clone();
        let fetch_timeout = Duration::from_secs(5);
        let _snapshot = ctx.create_snapshot(&symbols, self.data_engine.as_ref(), fetch_timeout).await;

        let current_equity = self.portfolio.equity(|symbol| {
            let entry = self.portfolio.position(symbol, &self.config.trading.primary_strategy).1;
            ctx.get_mark_price(cycle_id, symbol).ok().flatten().unwrap_or(entry)
        });
        if risk::daily_loss_limit_breached(self.session_start_equity, current_equity, self.config.risk.daily_loss_limit_pct) {
            self.halt_new_entries_today = true;
        }

        let candidates = self.build_candidates(&mut ctx, cycle_id, &symbols).await?;
        let decisions = self.select_entries(&candidates, current_equity);
        self.execute_decisions(&mut ctx, cycle_id, &candidates, &decisions).await?;
        self.run_exit_manager(&mut ctx, cycle_id).await?;
        self.assert_equity(&mut ctx, cycle_id).await?;
        self.persist_session_metadata()?;

        ctx.clear();
        Ok(())
    }

    /// Steps (signals + regime + preflight) for every symbol, producing the
    /// candidate list the entry gate selects from. Symbols failing
    /// regime/price/RR preflight are skipped here with a decision trace, so
    /// they never reach the gate.
    async fn build_candidates(&mut self, ctx: &mut CycleContext, cycle_id: u64, symbols: &[String]) -> EngineResult<Vec<EntryCandidate>> {
        let mut candidates = Vec::new();

        for symbol in symbols {
            let entry_price = ctx.get_entry_price(cycle_id, symbol)?;
            let entry_price = match entry_price {
                Some(p) => p,
                None => {
                    self.trace_skip(cycle_id, symbol, "unknown", 0.0, None, None, "data_unavailable");
                    continue;
                }
            };

            let ema_fast = self.data_engine.get_indicator(symbol, IndicatorName::Ema(regime::EMA_FAST_PERIOD)).await.ok().flatten();
            let ema_slow = self.data_engine.get_indicator(symbol, IndicatorName::Ema(regime::EMA_SLOW_PERIOD)).await.ok().flatten();
            let adx = self.data_engine.get_indicator(symbol, IndicatorName::Adx(regime::ADX_PERIOD)).await.ok().flatten();
            let atr = self.data_engine.get_indicator(symbol, IndicatorName::Atr(self.config.risk.risk_on.trigger.atr_period as u32)).await.ok().flatten();
            let atr_sma = self
                .data_engine
                .get_indicator(symbol, IndicatorName::SmaAtr(self.config.risk.risk_on.trigger.atr_sma_period as u32))
                .await
                .ok()
                .flatten();

            let ohlcv_limit = regime::EMA_SLOW_PERIOD.max(self.config.risk.risk_on.trigger.atr_sma_period as u32).max(regime::ADX_PERIOD) as usize;
            let bars_available = self.data_engine.get_ohlcv(symbol, &self.config.trading.timeframe, ohlcv_limit).await.map(|bars| bars.len()).unwrap_or(0);

            let indicators = Indicators { ema_fast, ema_slow, adx, bars_available };
            let (regime, reason) = regime::detect(&indicators, self.config.risk.risk_on.trigger.atr_sma_period);

            if reason == RegimeReason::InsufficientDataWarmup || regime == crate::regime::Regime::Unknown {
                self.trace_skip(cycle_id, symbol, "unknown", 0.0, Some(entry_price), None, "regime_unknown");
                continue;
            }

            if self.config.risk.risk_on.enabled {
                if let (Some(atr), Some(atr_sma)) = (atr, atr_sma) {
                    self.risk_on = self.risk_on.step(atr, atr_sma, &self.config.risk.risk_on.trigger, self.config.risk.risk_on.window_cycles);
                }
            }

            let signal = match self.signal_engine.composite_signal(symbol).await {
                Ok(s) => s,
                Err(_) => {
                    self.trace_skip(cycle_id, symbol, regime_label(regime), 0.0, Some(entry_price), None, "data_unavailable");
                    continue;
                }
            };

            let effective_threshold = self.signal_windows.get(symbol).and_then(|w| w.effective_threshold());
            let window = self.signal_windows.entry(symbol.clone()).or_insert_with(|| RollingWindow::new(RollingWindow::DEFAULT_CAPACITY));
            window.push(signal.composite_score);
            self.store
                .push_signal_window(
                    &self.session_id,
                    &SignalWindowRow { symbol: symbol.clone(), timeframe: self.config.trading.timeframe.clone(), strategy: self.config.trading.primary_strategy.clone(), value: signal.composite_score, ts: chrono::Utc::now().timestamp() },
                )
                .map_err(EngineError::Store)?;

            let side = if signal.composite_score >= 0.0 { Side::Long } else { Side::Short };
            let rules = self.config.symbol_rules(symbol);
            let (is_flat, _) = self.portfolio.position(symbol, &self.config.trading.primary_strategy);
            let is_flat = is_flat.is_zero();

            let sl_tp = risk::derive_sl_tp(
                side,
                entry_price,
                StrategyLevels { stop_loss: None, take_profit: None },
                atr,
                &SlTpParams {
                    atr_k_sl: self.config.risk.sl_tp.atr_k_sl,
                    atr_m_tp: self.config.risk.sl_tp.atr_m_tp,
                    enable_fallback: self.config.risk.sl_tp.enable_fallback,
                    fallback_sl_pct: self.config.risk.sl_tp.fallback_sl_pct,
                    fallback_tp_pct: self.config.risk.sl_tp.fallback_tp_pct,
                },
            );
            let Some(sl_tp) = sl_tp else {
                self.trace_skip(cycle_id, symbol, regime_label(regime), signal.composite_score, Some(entry_price), None, "no_atr_no_fallback");
                continue;
            };
            let rr = risk::compute_rr(entry_price, sl_tp.stop_loss, sl_tp.take_profit);
            let stop_frac = risk::stop_frac(entry_price, sl_tp.stop_loss);

            let preflight = risk::preflight(&PreflightInputs {
                side,
                is_flat,
                short_enabled_global: self.config.risk.short_enabled,
                short_allowed_symbol: rules.allow_short,
                stop_frac,
                min_stop_frac: self.config.risk.min_stop_frac,
                rr,
                rr_min: regime.floors().min_rr.max(self.config.risk.rr_min.to_f64().unwrap_or(0.0)),
                halt_new_entries_today: self.halt_new_entries_today,
            });
            if let Some(reason) = preflight {
                self.trace_skip(cycle_id, symbol, regime_label(regime), signal.composite_score, Some(entry_price), rr, reason.as_str());
                continue;
            }

            candidates.push(EntryCandidate {
                symbol: symbol.clone(),
                score: signal.composite_score,
                confidence: signal.confidence,
                regime,
                rr,
                winning_subsignal: signal.winning_subsignal().map(|(name, _)| name.to_string()),
                entry_price: Some(entry_price),
                effective_threshold,
            });
        }

        Ok(candidates)
    }

    /// Step "gate": ordinary selection, then pilot-trade and
    /// exploration-budget fallbacks in order if nothing was admitted.
    fn select_entries(&mut self, candidates: &[EntryCandidate], equity: Decimal) -> Vec<GateDecision> {
        if self.halt_new_entries_today {
            return candidates
                .iter()
                .map(|c| GateDecision::Skip { symbol: c.symbol.clone(), reason: crate::errors::RejectReason::DailyLossLimitHalt })
                .collect();
        }

        let effective_floor = if self.risk_on.is_active() { self.config.risk.risk_on.min_gate_floor } else { self.config.risk.entry_gate.hard_floor_min };
        let mut decisions = entry_gate::select_entries(candidates, &self.config.risk.entry_gate, effective_floor);

        if !decisions.iter().any(|d| matches!(d, GateDecision::Admit { .. })) {
            if let Some(pilot) = entry_gate::pilot_trade(candidates, self.config.risk.pilot_gate, self.config.risk.rr_relax_for_pilot) {
                for d in decisions.iter_mut() {
                    if d.symbol() == pilot.symbol {
                        *d = GateDecision::Admit { symbol: pilot.symbol.clone(), tier: SizeTier::Pilot };
                    }
                }
            } else {
                let notional_estimate = equity * self.config.risk.sizing.risk_per_trade_pct;
                if let Some(picked) = self.exploration.exploration_trade(candidates, &self.config.risk.exploration, equity, notional_estimate) {
                    for d in decisions.iter_mut() {
                        if d.symbol() == picked.symbol {
                            *d = GateDecision::Admit { symbol: picked.symbol.clone(), tier: SizeTier::Exploration };
                        }
                    }
                }
            }
        }

        decisions
    }

    /// Step "execute": size, slice, build, and simulate-fill every admitted
    /// candidate, then apply each simulated fill to the portfolio.
    async fn execute_decisions(&mut self, ctx: &mut CycleContext, cycle_id: u64, candidates: &[EntryCandidate], decisions: &[GateDecision]) -> EngineResult<()> {
        self.rate_limiter.acquire(CONNECTOR_VENUE).await;
        let supported = self.connector.get_supported_order_types().await.map_err(EngineError::Store)?;
        self.rate_limiter.acquire(CONNECTOR_VENUE).await;
        let fees = self.connector.get_fee_info("").await.map_err(EngineError::Store).unwrap_or(crate::contracts::FeeInfo::default());

        for decision in decisions {
            let (symbol, tier) = match decision {
                GateDecision::Admit { symbol, tier } => (symbol, *tier),
                GateDecision::Skip { symbol, reason } => {
                    let candidate = candidates.iter().find(|c| &c.symbol == symbol);
                    self.trace_skip(
                        cycle_id,
                        symbol,
                        candidate.map(|c| regime_label(c.regime)).unwrap_or("unknown"),
                        candidate.map(|c| c.score).unwrap_or(0.0),
                        candidate.and_then(|c| c.entry_price),
                        candidate.and_then(|c| c.rr),
                        reason.as_str(),
                    );
                    continue;
                }
            };
            let Some(candidate) = candidates.iter().find(|c| &c.symbol == symbol) else { continue };
            let Some(entry_price) = candidate.entry_price else { continue };

            let side = if candidate.score >= 0.0 { Side::Long } else { Side::Short };
            let rules = self.config.symbol_rules(symbol);
            let deployed_capital: Decimal = self
                .config
                .trading
                .symbols
                .iter()
                .map(|s| self.portfolio.position(s, &self.config.trading.primary_strategy).0.abs() * entry_price)
                .sum();

            let sl_tp = risk::derive_sl_tp(
                side,
                entry_price,
                StrategyLevels { stop_loss: None, take_profit: None },
                None,
                &SlTpParams {
                    atr_k_sl: self.config.risk.sl_tp.atr_k_sl,
                    atr_m_tp: self.config.risk.sl_tp.atr_m_tp,
                    enable_fallback: true,
                    fallback_sl_pct: self.config.risk.sl_tp.fallback_sl_pct,
                    fallback_tp_pct: self.config.risk.sl_tp.fallback_tp_pct,
                },
            );
            let Some(mut sl_tp) = sl_tp else { continue };
            if tier == SizeTier::Exploration {
                // Exploration trades carry a tighter stop on top of the
                // smaller size: shrink the stop distance, don't move the
                // take-profit.
                let mult = self.config.risk.exploration.tighter_stop_mult;
                sl_tp.stop_loss = match side {
                    Side::Long => entry_price - (entry_price - sl_tp.stop_loss) * mult,
                    Side::Short => entry_price + (sl_tp.stop_loss - entry_price) * mult,
                };
            }
            let stop_frac = risk::stop_frac(entry_price, sl_tp.stop_loss);

            let risk_pct = if self.risk_on.is_active() { self.config.risk.risk_on.risk_per_trade_pct } else { self.config.risk.sizing.risk_per_trade_pct };
            let mut target = target_notional(&SizingInputs {
                equity: self.session_start_equity,
                risk_per_trade_pct: risk_pct,
                stop_frac,
                per_symbol_cap_pct: self.config.risk.sizing.per_symbol_cap_pct,
                session_cap_pct: self.config.risk.sizing.session_cap_pct,
                deployed_capital,
            });
            target *= match tier {
                SizeTier::Normal => Decimal::ONE,
                SizeTier::Pilot => self.config.risk.sizing.pilot_multiplier,
                SizeTier::Exploration => self.config.risk.exploration.size_mult_vs_normal,
            };

            let slices = plan_slices(
                target,
                &SlicingParams {
                    default_slice_notional: self.config.execution.default_slice_notional,
                    min_slice_notional: self.config.execution.min_slice_notional,
                    max_slices_per_order: self.config.execution.max_slices_per_order,
                },
            );

            let mut rng = rand::thread_rng();
            let mut filled_any = false;
            for slice_notional in slices {
                let built = match build_order(entry_price, slice_notional, &rules, self.config.execution.max_order_retries) {
                    Ok(b) => b,
                    Err(reason) => {
                        self.trace_skip(cycle_id, symbol, regime_label(candidate.regime), candidate.score, Some(entry_price), candidate.rr, reason.as_str());
                        continue;
                    }
                };

                let order_type = order_manager::resolve_supported_type(OrderType::Market, &supported).unwrap_or(OrderType::Market);
                let mut order = Order::new(Uuid::new_v4().to_string(), symbol.clone(), side, order_type, built.quantity, None, false);
                order.submit();

                let liquidity = 1.0;
                if order_manager::fill_probability(&order, built.price, liquidity) <= 0.0 {
                    continue;
                }
                let sim = order_manager::simulate_fill(&order, built.price, built.quantity, fees, self.config.execution.slippage_bps, &mut rng);
                order.apply_fill("sim-fill", sim.qty);
                if order.state != OrderState::Filled && order.state != OrderState::PartiallyFilled {
                    continue;
                }

                let trade_id = Uuid::new_v4().to_string();
                let equity_before = self.portfolio.equity(|s| self.mark_price(ctx, cycle_id, s, entry_price));
                let now_ts = chrono::Utc::now().timestamp();
                let fill = Fill { side, qty: sim.qty, price: sim.price, fee: sim.fee };
                let entry_levels = crate::portfolio::EntryLevels { stop_loss: sl_tp.stop_loss, take_profit: sl_tp.take_profit, entry_time: now_ts, entry_qty: sim.qty };
                match self.portfolio.apply_fill(&mut *self.store, &self.session_id, symbol, &self.config.trading.primary_strategy, &trade_id, fill, equity_before, now_ts, Some(entry_levels)) {
                    Ok(outcome) => {
                        filled_any = true;
                        self.trade_ledger.record(crate::store::TradeRow {
                            trade_id,
                            symbol: symbol.clone(),
                            side: if side == Side::Long { "buy".into() } else { "sell".into() },
                            qty: sim.qty,
                            price: sim.price,
                            fee: sim.fee,
                            realized_pnl: outcome.realized_pnl,
                            ts: chrono::Utc::now().timestamp(),
                        });
                        if outcome.crossed_zero {
                            self.ladder.reset_symbol(symbol);
                        }
                        self.trace_admit(cycle_id, symbol, regime_label(candidate.regime), candidate.score, side, entry_price, sl_tp.stop_loss, sl_tp.take_profit, sim.qty, candidate.rr);
                    }
                    Err(EngineError::BudgetExhausted(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            let _ = filled_any;
        }

        Ok(())
    }

    /// Step "exits": stop/TP/time-stop/ladder for every open position,
    /// submitted as reduce-only IOC limit orders priced from the current
    /// mark (rounded to tick) and run through the same order-manager
    /// quantization/fill-simulation path as entries in `execute_decisions`.
    async fn run_exit_manager(&mut self, ctx: &mut CycleContext, cycle_id: u64) -> EngineResult<()> {
        self.rate_limiter.acquire(CONNECTOR_VENUE).await;
        let supported = self.connector.get_supported_order_types().await.map_err(EngineError::Store)?;
        self.rate_limiter.acquire(CONNECTOR_VENUE).await;
        let fees = self.connector.get_fee_info("").await.map_err(EngineError::Store).unwrap_or(crate::contracts::FeeInfo::default());
        let mut rng = rand::thread_rng();

        let positions: Vec<_> = self
            .config
            .trading
            .symbols
            .iter()
            .filter_map(|symbol| {
                let (qty, entry) = self.portfolio.position(symbol, &self.config.trading.primary_strategy);
                if qty.is_zero() {
                    return None;
                }
                let side = if qty > Decimal::ZERO { Side::Long } else { Side::Short };
                Some((symbol.clone(), qty, entry, side))
            })
            .collect();

        for (symbol, qty, entry, side) in positions {
            let mark = self.mark_price(ctx, cycle_id, &symbol, entry);

            // Prefer the SL/TP actually chosen by the three-tier derivation
            // when the position was opened (persisted on the position row);
            // fall back to a fresh fallback-tier derivation only for a
            // position hydrated from state written before this field
            // existed.
            let levels = self.portfolio.position_levels(&symbol, &self.config.trading.primary_strategy);
            let (stop_loss, take_profit, entry_time, entry_qty) = match levels.filter(|l| !l.stop_loss.is_zero() || !l.take_profit.is_zero()) {
                // `entry_qty` predates this field on some persisted rows; a
                // zero value there falls back to the live quantity so the
                // ladder still sizes against *something* rather than zero.
                Some(l) => {
                    let entry_qty = if l.entry_qty.is_zero() { qty.abs() } else { l.entry_qty };
                    (l.stop_loss, l.take_profit, chrono::DateTime::from_timestamp(l.entry_time, 0).unwrap_or_else(chrono::Utc::now), entry_qty)
                }
                None => {
                    let sl_tp = risk::derive_sl_tp(
                        side,
                        entry,
                        StrategyLevels { stop_loss: None, take_profit: None },
                        None,
                        &SlTpParams {
                            atr_k_sl: self.config.risk.sl_tp.atr_k_sl,
                            atr_m_tp: self.config.risk.sl_tp.atr_m_tp,
                            enable_fallback: true,
                            fallback_sl_pct: self.config.risk.sl_tp.fallback_sl_pct,
                            fallback_tp_pct: self.config.risk.sl_tp.fallback_tp_pct,
                        },
                    );
                    let Some(sl_tp) = sl_tp else { continue };
                    (sl_tp.stop_loss, sl_tp.take_profit, chrono::Utc::now(), qty.abs())
                }
            };

            let position = OpenPosition { symbol: symbol.clone(), side, qty: qty.abs(), entry_price: entry, stop_loss, take_profit, entry_time, entry_qty };

            let exit_value = ctx.get_exit_value(cycle_id, &symbol, side).ok().flatten().unwrap_or(mark);
            let Some(suggested) = exit_manager::evaluate_exit(&position, exit_value, chrono::Utc::now(), self.config.risk.exits.time_stop_hours, &self.config.risk.exits.tp_ladders, &mut self.ladder) else {
                continue;
            };

            let exit_side = if side == Side::Long { Side::Short } else { Side::Long };
            let rules = self.config.symbol_rules(&symbol);

            // Exits quantize to tick/step like entries but never bump: a
            // residual below min_qty/min_notional still closes at whatever
            // the venue will accept rather than being silently inflated
            // past the quantity actually held.
            let quantized = match build_order(suggested.price_hint, suggested.qty * suggested.price_hint, &rules, 0) {
                Ok(q) => q,
                Err(reason) => {
                    crate::logging::json_log(
                        "exit_manager",
                        "EXIT_SKIPPED",
                        crate::logging::obj(&[("symbol", crate::logging::v_str(&symbol)), ("reason", crate::logging::v_str(reason.as_str()))]),
                    );
                    continue;
                }
            };

            let order_type = order_manager::resolve_supported_type(OrderType::Limit, &supported).unwrap_or(OrderType::Market);
            let price_for_order = (order_type == OrderType::Limit).then_some(quantized.price);
            let mut order = Order::new(Uuid::new_v4().to_string(), symbol.clone(), exit_side, order_type, quantized.quantity, price_for_order, true);
            order.submit();

            let liquidity = 1.0;
            if order_manager::fill_probability(&order, quantized.price, liquidity) <= 0.0 {
                continue;
            }
            let sim = order_manager::simulate_fill(&order, quantized.price, quantized.quantity, fees, self.config.execution.slippage_bps, &mut rng);
            order.apply_fill("sim-fill", sim.qty);
            if order.state != OrderState::Filled && order.state != OrderState::PartiallyFilled {
                continue;
            }

            let trade_id = Uuid::new_v4().to_string();
            let equity_before = self.portfolio.equity(|s| self.mark_price(ctx, cycle_id, s, entry));
            let fill = Fill { side: exit_side, qty: sim.qty, price: sim.price, fee: sim.fee };
            match self.portfolio.apply_fill(&mut *self.store, &self.session_id, &symbol, &self.config.trading.primary_strategy, &trade_id, fill, equity_before, chrono::Utc::now().timestamp(), None) {
                Ok(outcome) => {
                    self.trade_ledger.record(crate::store::TradeRow {
                        trade_id,
                        symbol: symbol.clone(),
                        side: if exit_side == Side::Long { "buy".into() } else { "sell".into() },
                        qty: sim.qty,
                        price: sim.price,
                        fee: sim.fee,
                        realized_pnl: outcome.realized_pnl,
                        ts: chrono::Utc::now().timestamp(),
                    });
                    crate::logging::json_log(
                        "exit_manager",
                        "EXIT_SUBMITTED",
                        crate::logging::obj(&[("symbol", crate::logging::v_str(&symbol)), ("reason", crate::logging::v_str(&exit_reason_label(suggested.reason)))]),
                    );
                }
                Err(EngineError::InvariantViolation(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Step "assert": recompute equity, compare against the last persisted
    /// cash/equity row; tolerate drift up to `ε = max(1.00, 0.0001*equity)`,
    /// and attempt up to 3 reconciliation passes that overwrite the stored
    /// row with the recomputed value.
    async fn assert_equity(&mut self, ctx: &mut CycleContext, cycle_id: u64) -> EngineResult<()> {
        let recomputed = self.portfolio.equity(|s| self.mark_price(ctx, cycle_id, s, Decimal::ZERO));
        let last = self.store.last_cash_equity(&self.session_id).map_err(EngineError::Store)?;
        let epsilon = Decimal::ONE.max(Decimal::new(1, 4) * recomputed.abs());

        let mut reconciled = false;
        if let Some(last) = &last {
            if (last.equity - recomputed).abs() > epsilon {
                crate::logging::json_log(
                    "orchestrator",
                    "EQUITY_DRIFT_DETECTED",
                    crate::logging::obj(&[
                        ("persisted_equity", crate::logging::v_num(last.equity.to_f64().unwrap_or(0.0))),
                        ("recomputed_equity", crate::logging::v_num(recomputed.to_f64().unwrap_or(0.0))),
                    ]),
                );
                for _ in 0..RECONCILIATION_ATTEMPTS {
                    self.store
                        .append_cash_equity(&self.session_id, &CashEquityRow { ts: chrono::Utc::now().timestamp(), cash: self.portfolio.cash(), equity: recomputed })
                        .map_err(EngineError::Store)?;
                    let latest = self.store.last_cash_equity(&self.session_id).map_err(EngineError::Store)?;
                    if latest.map(|r| (r.equity - recomputed).abs() <= epsilon).unwrap_or(false) {
                        reconciled = true;
                        break;
                    }
                }
                if !reconciled {
                    crate::logging::json_log("orchestrator", "EQUITY_DRIFT_UNRECONCILED", crate::logging::obj(&[]));
                }
                return Ok(());
            }
        }

        self.store
            .append_cash_equity(&self.session_id, &CashEquityRow { ts: chrono::Utc::now().timestamp(), cash: self.portfolio.cash(), equity: recomputed })
            .map_err(EngineError::Store)?;
        Ok(())
    }

    fn persist_session_metadata(&mut self) -> EngineResult<()> {
        let ladder_pairs: Vec<serde_json::Value> = self.ladder.pairs().map(|(symbol, level)| serde_json::json!([symbol, level])).collect();
        let value = serde_json::json!({
            META_LADDER_KEY: ladder_pairs,
            META_HALT_KEY: self.halt_new_entries_today,
            META_EXPLORATION_COUNT_KEY: self.exploration.forced_count_today,
            META_EXPLORATION_NOTIONAL_KEY: self.exploration.used_notional_today.to_string(),
            META_DAY_KEY: self.halt_day,
        });
        self.store.set_session_metadata(&self.session_id, &value).map_err(EngineError::Store)
    }

    fn trace_skip(&self, cycle_id: u64, symbol: &str, regime: &str, score: f64, entry_price: Option<Decimal>, rr: Option<f64>, reason: &str) {
        DecisionTrace {
            cycle_id,
            symbol: symbol.to_string(),
            regime: regime.to_string(),
            composite_score: score,
            gate_floor: self.config.risk.entry_gate.hard_floor_min.to_f64().unwrap_or(0.0),
            passed_gate: false,
            final_action: FinalAction::Skip,
            winning_subsignal: None,
            reject_reason: Some(reason.to_string()),
            entry_price,
            stop_price: None,
            take_profit: None,
            size_qty: None,
            rr,
        }
        .emit();
    }

    #[allow(clippy::too_many_arguments)]
    fn trace_admit(&self, cycle_id: u64, symbol: &str, regime: &str, score: f64, side: Side, entry_price: Decimal, stop: Decimal, take_profit: Decimal, qty: Decimal, rr: Option<f64>) {
        DecisionTrace {
            cycle_id,
            symbol: symbol.to_string(),
            regime: regime.to_string(),
            composite_score: score,
            gate_floor: self.config.risk.entry_gate.hard_floor_min.to_f64().unwrap_or(0.0),
            passed_gate: true,
            final_action: if side == Side::Long { FinalAction::Buy } else { FinalAction::Sell },
            winning_subsignal: None,
            reject_reason: None,
            entry_price: Some(entry_price),
            stop_price: Some(stop),
            take_profit: Some(take_profit),
            size_qty: Some(qty),
            rr,
        }
        .emit();
    }
}

fn regime_label(regime: crate::regime::Regime) -> &'static str {
    match regime {
        crate::regime::Regime::Trend => "trend",
        crate::regime::Regime::Range => "range",
        crate::regime::Regime::Unknown => "unknown",
    }
}

fn exit_reason_label(reason: ExitReason) -> String {
    match reason {
        ExitReason::StopLoss => "stop_loss".to_string(),
        ExitReason::TakeProfit => "take_profit".to_string(),
        ExitReason::TimeStop => "time_stop".to_string(),
        ExitReason::ProfitLadder(idx) => format!("profit_ladder_{idx}"),
    }
}
