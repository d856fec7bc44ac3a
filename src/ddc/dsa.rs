//! Dynamic Sleep Adjustment.
//!
//! Per-bus adaptive sleep multiplier. `cur_step` is the bus's settled
//! multiplier; `retry_loop_step` is the multiplier actually in effect for
//! the retry loop currently in flight. Both index into [`STEPS`].

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use super::lock::BusId;

/// Multiplier table (×100). `get_sleep_multiplier` divides by 100.0.
pub const STEPS: [u16; 11] = [0, 5, 10, 20, 30, 50, 70, 100, 130, 160, 200];

const DEFAULT_LOOKBACK: usize = 5;
const DEFAULT_ADJUSTMENT_INTERVAL: u8 = 3;
const RING_CAPACITY: usize = 20;
// Index of the 1.0 multiplier (STEPS[7] == 100). The source special-cases
// "no table yet" to return a bare 1.0 multiplier; here that's just the
// default state's starting step.
pub(crate) const INITIAL_STEP: usize = 7;

/// One successful invocation recorded for the rolling-average adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessfulInvocation {
    pub epoch_seconds: u64,
    pub tryct: u8,
    pub required_step: usize,
}

/// Clock abstraction so DSA state is deterministically testable.
pub trait Clock: Send + Sync {
    fn now_unix_seconds(&self) -> u64;
}

/// Wall-clock implementation for production use.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Outcome of one `write_read_with_retry` / `write_only_with_retry` call, as
/// seen by `record_final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Failure,
}

/// DSA state for a single bus.
#[derive(Debug, Clone)]
pub struct BusDsaState {
    pub busno: BusId,
    pub cur_step: usize,
    pub retry_loop_step: usize,
    pub lookback: usize,
    pub remaining_interval: u8,
    pub min_ok_step: usize,
    pub found_failure_step: bool,
    pub recent_values: VecDeque<SuccessfulInvocation>,
}

impl BusDsaState {
    /// "no table" is treated as "create with defaults".
    pub fn new_default(busno: BusId) -> Self {
        BusDsaState {
            busno,
            cur_step: INITIAL_STEP,
            retry_loop_step: INITIAL_STEP,
            lookback: DEFAULT_LOOKBACK,
            remaining_interval: DEFAULT_ADJUSTMENT_INTERVAL,
            min_ok_step: 0,
            found_failure_step: false,
            recent_values: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    fn push_recent(&mut self, entry: SuccessfulInvocation) {
        if self.recent_values.len() == RING_CAPACITY {
            self.recent_values.pop_front();
        }
        self.recent_values.push_back(entry);
    }

    /// Last `k` successful invocations, oldest first.
    pub fn get_latest(&self, k: usize) -> Vec<SuccessfulInvocation> {
        let len = self.recent_values.len();
        let take_from = len.saturating_sub(k);
        self.recent_values.iter().skip(take_from).copied().collect()
    }
}

/// Step-up within a retry loop.
///
/// `STEPS.len - prev_step` steps remain, spread over `tries_remaining`
/// attempts; never exceeds the top step.
pub fn next_retry_step(prev_step: usize, tries_remaining: u32) -> usize {
    let remaining_steps = (STEPS.len() - prev_step) as f64;
    let tries_remaining = tries_remaining.max(1) as f64;
    let mut fadj = remaining_steps / tries_remaining;
    if fadj > 0.75 && fadj < 1.0 {
        fadj = 1.0;
    }
    let adjustment = fadj.trunc() as usize;
    (prev_step + adjustment).min(STEPS.len() - 1)
}

/// Per-bus Dynamic Sleep Adjustment controller.
pub struct DsaController {
    tables: Mutex<HashMap<BusId, BusDsaState>>,
    clock: Box<dyn Clock>,
    adjustment_interval: u8,
}

impl DsaController {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        DsaController {
            tables: Mutex::new(HashMap::new()),
            clock,
            adjustment_interval: DEFAULT_ADJUSTMENT_INTERVAL,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Box::new(SystemClock))
    }

    fn with_state<T>(&self, bus: BusId, f: impl FnOnce(&mut BusDsaState) -> T) -> T {
        let mut tables = self.tables.lock().unwrap();
        let state = tables.entry(bus).or_insert_with(|| BusDsaState::new_default(bus));
        f(state)
    }

    /// `STEPS[retry_loop_step] / 100.0`.
    pub fn get_sleep_multiplier(&self, bus: BusId) -> f64 {
        self.with_state(bus, |s| STEPS[s.retry_loop_step] as f64 / 100.0)
    }

    /// Force the retry-loop multiplier up to at least `STEPS[step_index]`,
    /// used when the retry controller wants a specific multiplier (e.g. the
    /// Null Response back-off bumping to `null_seen + 1`).
    pub fn set_retry_loop_step(&self, bus: BusId, step_index: usize) {
        self.with_state(bus, |s| {
            s.retry_loop_step = step_index.min(STEPS.len() - 1);
        });
    }

    /// Called on each retryable failure within a retry loop.
    pub fn note_retryable_failure(&self, bus: BusId, tries_remaining: u32) {
        self.with_state(bus, |s| {
            s.retry_loop_step = next_retry_step(s.retry_loop_step, tries_remaining);
        });
    }

    /// `adjust_for_recent_successes`.
    fn adjust_for_recent_successes(&self, bus: BusId) {
        self.with_state(bus, |s| {
            let lookback = s.lookback;
            let recent = s.get_latest(lookback);
            if recent.is_empty() {
                return;
            }
            let max_tryct = recent.iter().map(|r| r.tryct).max().unwrap_or(0);
            let total_tryct: u32 = recent.iter().map(|r| r.tryct as u32).sum();
            let too_many_errors =
                max_tryct > 3 || (total_tryct * 10) / (lookback as u32) > 14;

            if too_many_errors {
                s.cur_step = (s.cur_step + 1).min(STEPS.len() - 1);
                s.found_failure_step = true;
                s.min_ok_step = s.cur_step;
            } else if total_tryct as usize <= lookback + 1 {
                s.cur_step = s.cur_step.saturating_sub(1);
                s.min_ok_step = s.min_ok_step.min(s.cur_step);
            } else if s.found_failure_step && s.cur_step > s.min_ok_step {
                s.cur_step -= 1;
            } else {
                s.cur_step = s.cur_step.saturating_sub(1);
            }
        });
    }

    /// End-of-operation hook.
    pub fn record_final(&self, bus: BusId, outcome: OperationOutcome, tries: u8) {
        match outcome {
            OperationOutcome::Success => {
                let now = self.clock.now_unix_seconds();
                let retry_loop_step = self.with_state(bus, |s| s.retry_loop_step);
                self.with_state(bus, |s| {
                    s.push_recent(SuccessfulInvocation {
                        epoch_seconds: now,
                        tryct: tries,
                        required_step: retry_loop_step,
                    });
                });

                if tries > 3 {
                    self.with_state(bus, |s| {
                        s.cur_step = s.retry_loop_step;
                        s.min_ok_step = s.cur_step;
                        s.found_failure_step = true;
                    });
                } else if tries > 2 {
                    let hit_zero = self.with_state(bus, |s| {
                        s.remaining_interval = s.remaining_interval.saturating_sub(1);
                        s.remaining_interval == 0
                    });
                    if hit_zero {
                        self.adjust_for_recent_successes(bus);
                        self.with_state(bus, |s| s.remaining_interval = self.adjustment_interval);
                    }
                } else {
                    self.adjust_for_recent_successes(bus);
                    self.with_state(bus, |s| s.remaining_interval = self.adjustment_interval);
                }

                self.with_state(bus, |s| s.retry_loop_step = s.cur_step);
            }
            OperationOutcome::Failure => {
                self.with_state(bus, |s| {
                    s.remaining_interval = self.adjustment_interval;
                    s.retry_loop_step = INITIAL_STEP;
                });
            }
        }
    }

    /// Serialize every bus with recorded state to the `FORMAT 1` line
    /// grammar.
    pub fn save_to<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "FORMAT 1")?;
        let tables = self.tables.lock().unwrap();
        for state in tables.values() {
            write!(
                out,
                "{} {} {} {} {} {}",
                state.busno.0,
                state.cur_step,
                state.lookback,
                state.remaining_interval,
                state.min_ok_step,
                if state.found_failure_step { 1 } else { 0 },
            )?;
            for entry in &state.recent_values {
                write!(
                    out,
                    " {{{},{},{}}}",
                    entry.epoch_seconds, entry.tryct, entry.required_step
                )?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Parse a `FORMAT 1` persistence blob. On any parse error within a
    /// line, no table from that line is created, and lines already parsed
    /// successfully are kept.
    pub fn load_from<R: io::Read>(&self, input: R) -> io::Result<()> {
        let reader = io::BufReader::new(input);
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => return Ok(()),
        };
        if header.trim() != "FORMAT 1" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown persistence format: {header:?}"),
            ));
        }

        let mut loaded = HashMap::new();
        for line in lines {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('*') {
                continue;
            }
            let state = parse_state_line(trimmed)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed DSA line"))?;
            loaded.insert(state.busno, state);
        }

        let mut tables = self.tables.lock().unwrap();
        tables.extend(loaded);
        Ok(())
    }
}

fn parse_state_line(line: &str) -> Option<BusDsaState> {
    let mut fields = line.split_whitespace();
    let busno: u32 = fields.next()?.parse().ok()?;
    let cur_step: usize = fields.next()?.parse().ok()?;
    let lookback: usize = fields.next()?.parse().ok()?;
    let remaining_interval: u8 = fields.next()?.parse().ok()?;
    let min_ok_step: usize = fields.next()?.parse().ok()?;
    let found_failure_step = fields.next()? == "1";

    let mut recent_values = VecDeque::new();
    for token in fields {
        let inner = token.strip_prefix('{')?.strip_suffix('}')?;
        let mut parts = inner.split(',');
        let epoch_seconds: u64 = parts.next()?.parse().ok()?;
        let tryct: u8 = parts.next()?.parse().ok()?;
        let required_step: usize = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        recent_values.push_back(SuccessfulInvocation {
            epoch_seconds,
            tryct,
            required_step,
        });
    }

    if cur_step >= STEPS.len() || min_ok_step >= STEPS.len() {
        return None;
    }

    Some(BusDsaState {
        busno: BusId(busno),
        cur_step,
        retry_loop_step: cur_step,
        lookback,
        remaining_interval,
        min_ok_step,
        found_failure_step,
        recent_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(std::sync::atomic::AtomicU64);
    impl Clock for FixedClock {
        fn now_unix_seconds(&self) -> u64 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[test]
    fn s5_next_retry_step_examples() {
        assert_eq!(next_retry_step(3, 3), 5);
        assert_eq!(next_retry_step(7, 5), 8);
    }

    #[test]
    fn dsa_monotonicity_invariant() {
        for prev in 0..STEPS.len() {
            for tries in 1..10u32 {
                let next = next_retry_step(prev, tries);
                assert!(next >= prev);
                assert!(next <= STEPS.len() - 1);
            }
        }
    }

    #[test]
    fn multiplier_range_invariant() {
        let dsa = DsaController::new(Box::new(FixedClock(std::sync::atomic::AtomicU64::new(0))));
        let bus = BusId(3);
        for step in 0..STEPS.len() {
            dsa.set_retry_loop_step(bus, step);
            let m = dsa.get_sleep_multiplier(bus);
            assert!(STEPS.iter().any(|s| (*s as f64 / 100.0 - m).abs() < 1e-9));
        }
    }

    #[test]
    fn ring_buffer_eviction_order() {
        let mut state = BusDsaState::new_default(BusId(1));
        for i in 0..(RING_CAPACITY as u64 + 7) {
            state.push_recent(SuccessfulInvocation {
                epoch_seconds: i,
                tryct: 1,
                required_step: 0,
            });
        }
        let latest = state.get_latest(5);
        let expected: Vec<u64> = ((RING_CAPACITY as u64 + 2)..(RING_CAPACITY as u64 + 7)).collect();
        assert_eq!(
            latest.iter().map(|e| e.epoch_seconds).collect::<Vec<_>>(),
            expected
        );
    }

    #[test]
    fn persistence_round_trip() {
        let dsa = DsaController::new(Box::new(FixedClock(std::sync::atomic::AtomicU64::new(1000))));
        let bus = BusId(7);
        dsa.record_final(bus, OperationOutcome::Success, 1);
        dsa.record_final(bus, OperationOutcome::Success, 4);

        let mut buf = Vec::new();
        dsa.save_to(&mut buf).unwrap();

        let restored = DsaController::new(Box::new(FixedClock(std::sync::atomic::AtomicU64::new(1000))));
        restored.load_from(&buf[..]).unwrap();

        let original = dsa.with_state(bus, |s| s.clone());
        let round_tripped = restored.with_state(bus, |s| s.clone());
        assert_eq!(original.cur_step, round_tripped.cur_step);
        assert_eq!(original.lookback, round_tripped.lookback);
        assert_eq!(original.remaining_interval, round_tripped.remaining_interval);
        assert_eq!(original.min_ok_step, round_tripped.min_ok_step);
        assert_eq!(original.found_failure_step, round_tripped.found_failure_step);
        assert_eq!(
            original.recent_values.into_iter().collect::<Vec<_>>(),
            round_tripped.recent_values.into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dsa = DsaController::with_system_clock();
        let err = dsa.load_from("FORMAT 2\n".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn comments_are_skipped() {
        let dsa = DsaController::with_system_clock();
        let blob = "FORMAT 1\n# a comment\n* also a comment\n1 2 5 3 0 0\n";
        dsa.load_from(blob.as_bytes()).unwrap();
        assert!(dsa.tables.lock().unwrap().contains_key(&BusId(1)));
    }

    #[test]
    fn no_table_creates_defaults_on_first_access() {
        let dsa = DsaController::with_system_clock();
        let bus = BusId(42);
        // Open Question 2: accessing a bus with no table yet creates one
        // with defaults rather than returning a bare 1.0.
        let m = dsa.get_sleep_multiplier(bus);
        assert_eq!(m, STEPS[INITIAL_STEP] as f64 / 100.0);
        assert!(dsa.tables.lock().unwrap().contains_key(&bus));
    }
}
