//! Counter deltas to target frequency.
//!
//! Everything here is integer arithmetic. The only state the engine owns is
//! the per-event baseline used to turn absolute counter values into deltas.

use serde::Deserialize;

use crate::{
    datasource::perf_counter::CounterSource,
    error::{CounterError, GovernorError, GovernorResult},
    utils::constants::EVENT_COUNT,
};

/// Event slots as configured in `event_names`
pub const INSTRUCTIONS_INDEX: usize = 0;
pub const CYCLES_INDEX: usize = 1;
pub const STALLS_INDEX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicKind {
    /// Stalled cycles per cycle. Memory-bound windows get lower clocks.
    StallRatio,
    /// Instructions per cycle. Compute-bound windows get higher clocks.
    InstructionRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// lo threshold maps to min_freq, hi threshold to max_freq
    Proportional,
    /// lo threshold maps to max_freq, hi threshold to min_freq
    Inverse,
}

impl HeuristicKind {
    pub fn signal_index(self) -> usize {
        match self {
            HeuristicKind::StallRatio => STALLS_INDEX,
            HeuristicKind::InstructionRatio => INSTRUCTIONS_INDEX,
        }
    }

    pub fn default_direction(self) -> Direction {
        match self {
            HeuristicKind::StallRatio => Direction::Inverse,
            HeuristicKind::InstructionRatio => Direction::Proportional,
        }
    }
}

/// A heuristic variant with its thresholds, expressed as ratio * 100
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heuristic {
    kind: HeuristicKind,
    direction: Direction,
    lo_thresh: u64,
    hi_thresh: u64,
}

impl Heuristic {
    pub fn new(kind: HeuristicKind, lo_thresh: u64, hi_thresh: u64) -> GovernorResult<Self> {
        if lo_thresh >= hi_thresh {
            return Err(GovernorError::InvalidConfig(format!(
                "heuristic thresholds must satisfy lo < hi (lo={lo_thresh}, hi={hi_thresh})"
            )));
        }
        Ok(Self {
            kind,
            direction: kind.default_direction(),
            lo_thresh,
            hi_thresh,
        })
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn kind(&self) -> HeuristicKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn thresholds(&self) -> (u64, u64) {
        (self.lo_thresh, self.hi_thresh)
    }

    /// Clamps `ratio` into the thresholds and rescales it to 0..=100
    pub fn power_percent(&self, ratio: u64) -> u64 {
        let clamped = ratio.clamp(self.lo_thresh, self.hi_thresh);
        let span = u128::from(self.hi_thresh - self.lo_thresh);
        let scaled = (u128::from(clamped - self.lo_thresh) * 100 / span) as u64;
        match self.direction {
            Direction::Proportional => scaled,
            Direction::Inverse => 100 - scaled,
        }
    }
}

/// Hardware bounds of a domain in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqBounds {
    pub min: u32,
    pub max: u32,
}

impl FreqBounds {
    pub fn contains(&self, freq: u32) -> bool {
        (self.min..=self.max).contains(&freq)
    }

    pub fn interpolate(&self, percent: u64) -> u32 {
        let span = u64::from(self.max - self.min);
        let offset = percent.min(100) * span / 100;
        self.min + offset as u32
    }
}

/// `signal * 100 / cycles`, saturating instead of overflowing
pub fn ratio_percent(signal: u64, cycles: u64) -> u64 {
    let ratio = u128::from(signal) * 100 / u128::from(cycles);
    u64::try_from(ratio).unwrap_or(u64::MAX)
}

/// Computes the frequency to request for one window.
///
/// `None` marks a counter the hardware could not provide; if the heuristic
/// needs it the result is `bounds.max`. A zero-cycle window returns
/// `last_applied` unchanged.
pub fn decide(
    deltas: &[Option<u64>; EVENT_COUNT],
    bounds: FreqBounds,
    last_applied: u32,
    heuristic: &Heuristic,
) -> u32 {
    let (Some(cycles), Some(signal)) = (deltas[CYCLES_INDEX], deltas[heuristic.kind.signal_index()])
    else {
        return bounds.max;
    };

    if cycles == 0 {
        return last_applied;
    }

    let ratio = ratio_percent(signal, cycles);
    bounds.interpolate(heuristic.power_percent(ratio))
}

/// Last absolute value seen per event
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CounterBaselines {
    values: [u64; EVENT_COUNT],
}

impl CounterBaselines {
    pub fn baseline(&self, index: usize) -> u64 {
        self.values[index]
    }

    /// Consumes a fresh absolute value and returns the delta to the previous one
    pub fn advance(&mut self, index: usize, absolute: u64) -> u64 {
        let delta = absolute.wrapping_sub(self.values[index]);
        self.values[index] = absolute;
        delta
    }

    /// Reads every event once. Failed reads leave their baseline untouched.
    pub fn sample(&mut self, source: &mut dyn CounterSource) -> [Result<u64, CounterError>; EVENT_COUNT] {
        std::array::from_fn(|index| {
            source
                .read(index)
                .map(|absolute| self.advance(index, absolute))
        })
    }
}
