/// Backpressure hints for producers that outpace the worker pool.
///
/// Three signals mark a session as congested: its queue was already full on
/// several consecutive enqueues, the pool's mean service time over the last
/// frames exceeds a threshold, or the client has been sending faster than its
/// share of the pool's throughput. A congested session receives a suggested
/// frame rate, at most once per cooldown. Nothing here ever disconnects.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::shared::constants::{
    DEFAULT_HINT_COOLDOWN_MS, DEFAULT_LATENCY_THRESHOLD_MS, DEFAULT_QUEUE_FULL_STREAK,
    LATENCY_WINDOW,
};

/// Arrival history needed before the incoming rate is trusted.
const SUSTAINED_SPAN: Duration = Duration::from_secs(1);

/// Rolling window of per-frame service times across the whole pool.
pub struct PoolLatency {
    samples: Mutex<VecDeque<Duration>>,
    window: usize,
    workers: usize,
}

impl PoolLatency {
    pub fn new(workers: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            window: LATENCY_WINDOW,
            workers: workers.max(1),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.lock();
        samples.push_back(elapsed);
        while samples.len() > self.window {
            samples.pop_front();
        }
    }

    pub fn average(&self) -> Option<Duration> {
        let samples = self.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Frames per second the whole pool sustains at the current mean.
    pub fn throughput_fps(&self) -> Option<f64> {
        let avg = self.average()?.as_secs_f64();
        if avg <= 0.0 {
            return None;
        }
        Some(self.workers as f64 / avg)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Duration>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-session congestion counters.
#[derive(Debug, Default)]
pub struct SessionRate {
    full_streak: u32,
    last_hint: Option<Instant>,
    arrivals: VecDeque<Instant>,
}

impl SessionRate {
    /// Notes one accepted frame; `queue_was_full` means it evicted another.
    pub fn observe_enqueue(&mut self, queue_was_full: bool, now: Instant) {
        if queue_was_full {
            self.full_streak += 1;
        } else {
            self.full_streak = 0;
        }
        self.arrivals.push_back(now);
        while self.arrivals.len() > LATENCY_WINDOW {
            self.arrivals.pop_front();
        }
    }

    /// Frames per second the client has been sending recently.
    pub fn incoming_fps(&self) -> f64 {
        match (self.arrivals.front(), self.arrivals.back()) {
            (Some(first), Some(last)) if self.arrivals.len() > 1 => {
                let span = last.saturating_duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (self.arrivals.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// The incoming rate, once arrivals cover at least `SUSTAINED_SPAN`.
    fn sustained_fps(&self) -> Option<f64> {
        let (first, last) = (self.arrivals.front()?, self.arrivals.back()?);
        (last.saturating_duration_since(*first) >= SUSTAINED_SPAN).then(|| self.incoming_fps())
    }

    pub fn full_streak(&self) -> u32 {
        self.full_streak
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSettings {
    pub latency_threshold: Duration,
    pub queue_full_streak: u32,
    pub hint_cooldown: Duration,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            latency_threshold: Duration::from_millis(DEFAULT_LATENCY_THRESHOLD_MS),
            queue_full_streak: DEFAULT_QUEUE_FULL_STREAK,
            hint_cooldown: Duration::from_millis(DEFAULT_HINT_COOLDOWN_MS),
        }
    }
}

pub struct RateController {
    settings: RateSettings,
    latency: Arc<PoolLatency>,
}

impl RateController {
    pub fn new(settings: RateSettings, latency: Arc<PoolLatency>) -> Self {
        Self { settings, latency }
    }

    /// Returns a recommended frame rate when `rate` is congested and no hint
    /// went out within the cooldown.
    ///
    /// The recommendation is the pool throughput split across
    /// `processing_sessions`, never above the client's own sustained rate,
    /// kept within `1..target_fps`.
    pub fn assess(
        &self,
        rate: &mut SessionRate,
        target_fps: u32,
        processing_sessions: usize,
        now: Instant,
    ) -> Option<u32> {
        let share = self.share_fps(processing_sessions);
        let incoming = rate.sustained_fps();

        let queue_saturated = rate.full_streak >= self.settings.queue_full_streak;
        let pool_slow = self
            .latency
            .average()
            .is_some_and(|avg| avg > self.settings.latency_threshold);
        let over_share = matches!((incoming, share), (Some(i), Some(s)) if i > s);
        if !queue_saturated && !pool_slow && !over_share {
            return None;
        }
        if let Some(last) = rate.last_hint {
            if now.saturating_duration_since(last) < self.settings.hint_cooldown {
                return None;
            }
        }

        let recommended = recommend(target_fps, share, incoming);
        rate.last_hint = Some(now);
        log::info!(
            "Congestion (queue streak {}, pool slow {pool_slow}, incoming {:.1} fps): recommending {recommended} fps",
            rate.full_streak,
            incoming.unwrap_or_default()
        );
        Some(recommended)
    }

    /// Pool throughput per processing session.
    fn share_fps(&self, processing_sessions: usize) -> Option<f64> {
        self.latency
            .throughput_fps()
            .map(|fps| fps / processing_sessions.max(1) as f64)
    }
}

fn recommend(target_fps: u32, share: Option<f64>, incoming: Option<f64>) -> u32 {
    let mut base = share.map_or(target_fps / 2, |s| s.floor() as u32);
    if let Some(incoming) = incoming {
        base = base.min(incoming.floor() as u32);
    }
    base.min(target_fps.saturating_sub(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(latency: Arc<PoolLatency>) -> RateController {
        RateController::new(RateSettings::default(), latency)
    }

    fn saturate(rate: &mut SessionRate, now: Instant) {
        for _ in 0..3 {
            rate.observe_enqueue(true, now);
        }
    }

    #[test]
    fn test_latency_window_keeps_last_samples() {
        let latency = PoolLatency::new(1);
        latency.record(Duration::from_secs(10));
        for _ in 0..LATENCY_WINDOW {
            latency.record(Duration::from_millis(100));
        }
        assert_eq!(latency.average(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_throughput_scales_with_workers() {
        let latency = PoolLatency::new(4);
        latency.record(Duration::from_millis(200));
        let fps = latency.throughput_fps().unwrap();
        assert!((fps - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_hint_without_congestion() {
        let ctl = controller(Arc::new(PoolLatency::new(1)));
        let mut rate = SessionRate::default();
        let now = Instant::now();
        rate.observe_enqueue(true, now);
        rate.observe_enqueue(true, now);
        assert_eq!(ctl.assess(&mut rate, 10, 1, now), None);
    }

    #[test]
    fn test_streak_resets_when_queue_has_room() {
        let mut rate = SessionRate::default();
        let now = Instant::now();
        rate.observe_enqueue(true, now);
        rate.observe_enqueue(true, now);
        rate.observe_enqueue(false, now);
        assert_eq!(rate.full_streak(), 0);
    }

    #[test]
    fn test_saturated_queue_triggers_hint_within_bounds() {
        let ctl = controller(Arc::new(PoolLatency::new(1)));
        let mut rate = SessionRate::default();
        let now = Instant::now();
        saturate(&mut rate, now);

        let hint = ctl.assess(&mut rate, 10, 1, now).unwrap();
        assert!((1..=10).contains(&hint));
    }

    #[test]
    fn test_hint_respects_cooldown() {
        let ctl = controller(Arc::new(PoolLatency::new(1)));
        let mut rate = SessionRate::default();
        let now = Instant::now();
        saturate(&mut rate, now);

        assert!(ctl.assess(&mut rate, 10, 1, now).is_some());
        assert!(ctl
            .assess(&mut rate, 10, 1, now + Duration::from_millis(500))
            .is_none());
        assert!(ctl
            .assess(&mut rate, 10, 1, now + Duration::from_millis(2000))
            .is_some());
    }

    #[test]
    fn test_slow_pool_triggers_hint_from_throughput() {
        let latency = Arc::new(PoolLatency::new(2));
        latency.record(Duration::from_millis(800));
        let ctl = controller(latency);
        let mut rate = SessionRate::default();

        // 2 workers / 0.8 s = 2.5 fps, split over 2 sessions = 1.25 → 1
        assert_eq!(ctl.assess(&mut rate, 10, 2, Instant::now()), Some(1));
    }

    #[test]
    fn test_recommendation_never_exceeds_target() {
        let latency = Arc::new(PoolLatency::new(8));
        latency.record(Duration::from_millis(600));
        let ctl = controller(latency);
        let mut rate = SessionRate::default();

        assert_eq!(ctl.assess(&mut rate, 5, 1, Instant::now()), Some(4));
    }

    #[test]
    fn test_recommendation_floor_is_one() {
        let ctl = controller(Arc::new(PoolLatency::new(1)));
        let mut rate = SessionRate::default();
        let now = Instant::now();
        saturate(&mut rate, now);
        assert_eq!(ctl.assess(&mut rate, 1, 1, now), Some(1));
    }

    /// Enqueues `count` frames `gap` apart, starting at `start`.
    fn arrive(rate: &mut SessionRate, start: Instant, gap: Duration, count: u32, full: bool) {
        for i in 0..count {
            rate.observe_enqueue(full, start + gap * i);
        }
    }

    #[test]
    fn test_client_faster_than_share_triggers_hint() {
        // One worker at 200 ms sustains 5 fps, under the slow-pool threshold.
        let latency = Arc::new(PoolLatency::new(1));
        latency.record(Duration::from_millis(200));
        let ctl = controller(latency);
        let start = Instant::now();

        let mut fast = SessionRate::default();
        arrive(&mut fast, start, Duration::from_millis(50), 21, false);
        assert_eq!(ctl.assess(&mut fast, 30, 1, start + Duration::from_secs(1)), Some(5));

        let mut slow = SessionRate::default();
        arrive(&mut slow, start, Duration::from_millis(250), 6, false);
        assert_eq!(ctl.assess(&mut slow, 30, 1, start + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_short_burst_is_not_a_sustained_rate() {
        let latency = Arc::new(PoolLatency::new(1));
        latency.record(Duration::from_millis(200));
        let ctl = controller(latency);
        let start = Instant::now();
        let mut rate = SessionRate::default();
        arrive(&mut rate, start, Duration::from_millis(10), 10, false);

        assert_eq!(ctl.assess(&mut rate, 30, 1, start + Duration::from_millis(100)), None);
    }

    #[test]
    fn test_hint_never_exceeds_incoming_rate() {
        // No latency samples yet, so the share falls back to target / 2 = 10.
        let ctl = controller(Arc::new(PoolLatency::new(1)));
        let start = Instant::now();
        let mut rate = SessionRate::default();
        arrive(&mut rate, start, Duration::from_millis(250), 5, true);

        assert!((rate.incoming_fps() - 4.0).abs() < 1e-6);
        assert_eq!(ctl.assess(&mut rate, 20, 1, start + Duration::from_secs(1)), Some(4));
    }

    #[test]
    fn test_incoming_fps() {
        let mut rate = SessionRate::default();
        let start = Instant::now();
        for i in 0..5 {
            rate.observe_enqueue(false, start + Duration::from_millis(i * 100));
        }
        assert!((rate.incoming_fps() - 10.0).abs() < 1e-6);
    }
}
