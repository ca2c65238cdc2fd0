//! Signal types.
//!
//! The concrete strategy math producing a composite score is external; this
//! module only defines the typed shape a `SignalEngine` implementation must
//! return — tagged structs in place of a dynamically-typed dict.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubSignal {
    pub score: f64,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub symbol: String,
    /// In `[-1.0, 1.0]`; sign gives direction, magnitude gives conviction.
    pub composite_score: f64,
    pub confidence: f64,
    pub per_strategy: HashMap<String, SubSignal>,
}

impl Signal {
    /// The sub-signal with the largest absolute contribution
    /// (`score * weight`), used to populate `DecisionTrace::winning_subsignal`.
    pub fn winning_subsignal(&self) -> Option<(&str, f64)> {
        self.per_strategy
            .iter()
            .map(|(name, s)| (name.as_str(), s.score * s.weight))
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
    }
}

/// Bounded rolling window of raw signal values for one
/// `(symbol, timeframe, strategy_name)` tuple, capped at N=200.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    pub capacity: usize,
    values: std::collections::VecDeque<f64>,
}

impl RollingWindow {
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(capacity: usize) -> Self {
        Self { capacity, values: std::collections::VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn values(&self) -> &std::collections::VecDeque<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The effective threshold used by the entry gate: the window's mean
    /// plus one standard deviation, floored at zero. With fewer than two
    /// samples the window cannot normalize, so the caller's configured
    /// floor applies instead.
    pub fn effective_threshold(&self) -> Option<f64> {
        if self.values.len() < 2 {
            return None;
        }
        let n = self.values.len() as f64;
        let mean = self.values.iter().sum::<f64>() / n;
        let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some((mean + var.sqrt()).max(0.0))
    }
}
