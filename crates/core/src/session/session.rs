use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::auth::token_verifier::Identity;
use crate::pipeline::frame_processor::SessionPipeline;
use crate::pipeline::rate_controller::SessionRate;
use crate::protocol::event_sink::EventSink;
use crate::protocol::outbound::{ServerEvent, StreamMetrics};
use crate::shared::constants::LATENCY_WINDOW;

use super::frame_queue::{FrameQueue, QueuedFrame};
use super::session_config::SessionConfig;
use super::stream_error::StreamError;

pub type SessionId = String;

/// Lifecycle of a streaming connection.
///
/// A session object only exists once authentication succeeded; the transport
/// owns the connect handshake. `Closed` sessions linger briefly while a
/// worker still holds a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Processing,
    Closed,
}

/// Counters reported in periodic `status` metrics.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub processed_frames: u64,
    pub dropped_frames: u64,
    recent_service: VecDeque<Duration>,
    recent_completions: VecDeque<Instant>,
}

impl SessionStats {
    pub fn record_result(&mut self, service: Duration, now: Instant) {
        self.processed_frames += 1;
        self.recent_service.push_back(service);
        self.recent_completions.push_back(now);
        while self.recent_service.len() > LATENCY_WINDOW {
            self.recent_service.pop_front();
        }
        while self.recent_completions.len() > LATENCY_WINDOW {
            self.recent_completions.pop_front();
        }
    }

    /// Results per second over the recent window.
    pub fn current_fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.recent_completions.front(), self.recent_completions.back())
        else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if self.recent_completions.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.recent_completions.len() - 1) as f64 / span
    }

    /// Mean service time in seconds over the recent window.
    pub fn average_processing_time(&self) -> f64 {
        if self.recent_service.is_empty() {
            return 0.0;
        }
        self.recent_service.iter().sum::<Duration>().as_secs_f64() / self.recent_service.len() as f64
    }
}

/// All state the server keeps for one client connection.
///
/// Guarded by its own mutex in the registry. `generation` increases on every
/// stop and close; a worker compares it before and after a frame to learn
/// whether its result is still wanted.
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) identity: Identity,
    pub(crate) state: SessionState,
    pub(crate) client_id: Option<String>,
    pub(crate) config: Option<SessionConfig>,
    pub(crate) queue: FrameQueue<QueuedFrame>,
    pub(crate) last_frame_id: Option<u64>,
    pub(crate) busy: bool,
    pub(crate) generation: u64,
    pub(crate) pipeline: Option<SessionPipeline>,
    pub(crate) rate: SessionRate,
    pub(crate) stats: SessionStats,
    pub(crate) created_at: Instant,
    pub(crate) last_activity: Instant,
    sink: Arc<dyn EventSink>,
}

impl Session {
    pub fn new(
        id: SessionId,
        identity: Identity,
        sink: Arc<dyn EventSink>,
        queue_capacity: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            identity,
            state: SessionState::Idle,
            client_id: None,
            config: None,
            queue: FrameQueue::new(queue_capacity),
            last_frame_id: None,
            busy: false,
            generation: 0,
            pipeline: None,
            rate: SessionRate::default(),
            stats: SessionStats::default(),
            created_at: now,
            last_activity: now,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn emit(&self, event: ServerEvent) {
        self.sink.emit(event);
    }

    pub fn close_transport(&self) {
        self.sink.close();
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Rejects frame ids lower than the last accepted one.
    pub fn check_frame_order(&self, frame_id: u64) -> Result<(), StreamError> {
        match self.last_frame_id {
            Some(last) if frame_id < last => Err(StreamError::validation(format!(
                "Frame {frame_id} is out of order (last accepted {last})"
            ))),
            _ => Ok(()),
        }
    }

    /// Queues a frame, evicting the oldest if the queue is full.
    ///
    /// Returns true when an older frame was dropped to make room.
    pub fn enqueue(&mut self, frame: QueuedFrame, now: Instant) -> bool {
        self.last_frame_id = Some(frame.frame_id());
        let was_full = self.queue.is_full();
        if let Some(evicted) = self.queue.push(frame) {
            log::debug!("Session {}: dropped frame {}", self.id, evicted.frame_id());
            self.stats.dropped_frames += 1;
        }
        self.rate.observe_enqueue(was_full, now);
        was_full
    }

    pub fn start(&mut self) {
        self.state = SessionState::Processing;
    }

    /// Back to `Idle`: pending frames and tracked faces are discarded and any
    /// in-flight frame becomes stale.
    pub fn stop(&mut self) {
        self.state = SessionState::Idle;
        self.invalidate();
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.reset();
        }
    }

    /// Final transition; releases all per-session processing state.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.invalidate();
        self.pipeline = None;
    }

    pub fn metrics(&self) -> StreamMetrics {
        StreamMetrics {
            processed_frames: self.stats.processed_frames,
            dropped_frames: self.stats.dropped_frames,
            current_fps: self.stats.current_fps(),
            incoming_fps: self.rate.incoming_fps(),
            average_processing_time: self.stats.average_processing_time(),
            tracking_faces: self
                .pipeline
                .as_ref()
                .map_or(0, SessionPipeline::tracking_faces),
            queue_depth: self.queue.len(),
        }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        let discarded = self.queue.clear();
        if discarded > 0 {
            log::debug!("Session {}: discarded {discarded} queued frames", self.id);
        }
        self.last_frame_id = None;
        self.rate.reset();
    }
}
