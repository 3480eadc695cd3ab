use crate::config::ReplayParams;
use crate::event::Event;
use crate::types::TimingStrategy;
use rand::Rng;

/// Preempts the strategy-based delay. The first override returning `Some`
/// decides the delay for that step.
pub trait TimingOverride: Send {
    fn name(&self) -> &'static str;
    fn delay_ms(&self, events: &[Event], index: usize, next: usize) -> Option<u64>;
}

/// Events that carry a learned wait event are gated by their trigger, so
/// they go out as soon as it is observed instead of after a recorded pause.
#[derive(Debug, Default)]
pub struct TriggeredEventsNoWait;

impl TimingOverride for TriggeredEventsNoWait {
    fn name(&self) -> &'static str {
        "triggered_no_wait"
    }

    fn delay_ms(&self, events: &[Event], _index: usize, next: usize) -> Option<u64> {
        events
            .get(next)
            .filter(|e| e.timing.wait_event.is_some())
            .map(|_| 0)
    }
}

/// Index of the first replayable event at or after `index`, or `events.len()`.
pub fn next_replayable_index(events: &[Event], index: usize) -> usize {
    events
        .iter()
        .enumerate()
        .skip(index)
        .find(|(_, e)| e.kind.is_replayable())
        .map_or(events.len(), |(i, _)| i)
}

/// Sum of recorded waits from `index` through `next`, capped.
pub fn recorded_wait(events: &[Event], index: usize, next: usize, max_wait_ms: u64) -> u64 {
    let total = events
        .iter()
        .skip(index)
        .take(next.saturating_sub(index) + 1)
        .map(|e| e.timing.wait_time.max(0) as u64)
        .sum::<u64>();
    total.min(max_wait_ms)
}

/// Milliseconds to wait before dispatching the next replayable event.
pub fn next_delay<R: Rng + ?Sized>(
    events: &[Event],
    index: usize,
    strategy: TimingStrategy,
    params: &ReplayParams,
    overrides: &[Box<dyn TimingOverride>],
    rng: &mut R,
) -> u64 {
    let next = next_replayable_index(events, index);
    for timing_override in overrides {
        if let Some(delay) = timing_override.delay_ms(events, index, next) {
            return delay;
        }
    }

    if next >= events.len() {
        return 0;
    }
    if index == 0 {
        return params.first_dispatch_delay_ms;
    }

    let base = recorded_wait(events, index, next, params.max_wait_ms);
    match strategy {
        TimingStrategy::Mimic => base,
        TimingStrategy::Speed => 0,
        TimingStrategy::Slower => base * 2,
        TimingStrategy::Slowest => base * 4,
        TimingStrategy::Fixed1 => 1000,
        TimingStrategy::Random0To3 => rng.random_range(0..=3000),
        TimingStrategy::Perturb0To3 => base + rng.random_range(0..=3000),
        TimingStrategy::Perturb => {
            let scale: f64 = rng.random_range(0.7..=1.3);
            (base as f64 * scale).round() as u64
        }
    }
}
