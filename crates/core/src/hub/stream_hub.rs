use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::auth::guest_quota::{GuestQuota, QuotaStatus};
use crate::auth::token_verifier::{AuthError, Identity, TokenVerifier};
use crate::detection::infrastructure::model_handles::ModelHandles;
use crate::pipeline::frame_processor::{FrameProcessor, SessionPipeline};
use crate::pipeline::infrastructure::worker_pool::{PipelineFactory, WorkerContext, WorkerPool};
use crate::pipeline::rate_controller::{PoolLatency, RateController};
use crate::protocol::event_sink::EventSink;
use crate::protocol::frame_decoder::FrameDecoder;
use crate::protocol::inbound::{ClientEvent, ControlPayload, InitializePayload, VideoFramePayload};
use crate::protocol::outbound::{unix_timestamp, EffectiveConfig, InitializedPayload, ServerEvent};
use crate::session::frame_queue::QueuedFrame;
use crate::session::session::{Session, SessionId, SessionState};
use crate::session::session_config::SessionConfig;
use crate::session::session_registry::{lock_session, SessionRegistry, SessionSlot};
use crate::session::stream_error::StreamError;
use crate::shared::constants::SUPPORTED_ACTIONS;
use crate::tracking::emotion_smoother::EmotionSmoother;
use crate::tracking::face_tracker::FaceTracker;

use super::hub_config::HubConfig;

/// Session and protocol state machine shared by every connection.
///
/// Transports call `connect` once per connection and then feed each parsed
/// event to `handle`. Replies and results go out through the `EventSink`
/// registered at connect; only `connect` itself reports failure by return
/// value, since no session exists yet to send it to.
pub struct StreamHub {
    config: HubConfig,
    registry: Arc<SessionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    guest_quota: GuestQuota,
    decoder: FrameDecoder,
    rate: RateController,
    pool: WorkerPool,
    new_pipeline: PipelineFactory,
    next_session: AtomicU64,
}

impl StreamHub {
    pub fn new(
        config: HubConfig,
        models: Arc<ModelHandles>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let workers = config.worker_count();
        let latency = Arc::new(PoolLatency::new(workers));

        let iou_threshold = config.track_iou_threshold;
        let grace = config.fade_grace;
        let new_pipeline: PipelineFactory = Arc::new(move |window| {
            SessionPipeline::new(
                FaceTracker::new(iou_threshold, grace),
                EmotionSmoother::new(window),
            )
        });

        let pool = WorkerPool::start(
            workers,
            WorkerContext {
                registry: registry.clone(),
                processor: FrameProcessor::new(models),
                latency: latency.clone(),
                new_pipeline: new_pipeline.clone(),
                metrics_interval: config.metrics_interval,
            },
        );

        Self {
            guest_quota: GuestQuota::new(config.guest_max_requests, config.guest_window()),
            decoder: FrameDecoder::new(config.max_payload_bytes, config.max_resolution),
            rate: RateController::new(config.rate_settings(), latency),
            config,
            registry,
            verifier,
            pool,
            new_pipeline,
            next_session: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Authenticates a new connection and creates its session in `Idle`.
    pub fn connect(
        &self,
        token: Option<&str>,
        sink: Arc<dyn EventSink>,
    ) -> Result<SessionId, StreamError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StreamError::from(AuthError::MissingToken))?;

        if self.registry.len() >= self.config.max_connections {
            log::warn!(
                "Refusing connection: {} sessions open",
                self.registry.len()
            );
            return Err(StreamError::ServiceUnavailable(
                "Server is at capacity".into(),
            ));
        }

        let identity = self.verifier.verify(token).map_err(|e| {
            log::warn!("Refusing connection: {e}");
            StreamError::from(e)
        })?;

        let id = format!("sess-{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        let guest = identity.is_guest();
        self.registry.insert(Session::new(
            id.clone(),
            identity,
            sink,
            self.config.queue_capacity,
            Instant::now(),
        ));
        log::info!(
            "Session {id} connected ({}, {} open)",
            if guest { "guest" } else { "user" },
            self.registry.len()
        );
        Ok(id)
    }

    /// Routes one inbound event, answering failures with `error_message`.
    pub fn handle(&self, session_id: &str, event: ClientEvent) {
        let frame_id = event.frame_id();
        let name = event.name();
        let result = match event {
            ClientEvent::Connect(_) => Err(StreamError::validation("Already connected")),
            ClientEvent::Initialize(payload) => self.initialize(session_id, payload),
            ClientEvent::Control(payload) => self.control(session_id, payload),
            ClientEvent::VideoFrame(payload) => self.video_frame(session_id, payload),
            ClientEvent::Disconnect => {
                self.disconnect(session_id);
                Ok(())
            }
        };

        if let Err(err) = result {
            log::debug!("Session {session_id}: {name} rejected with {}: {err}", err.code());
            if let Some(slot) = self.registry.get(session_id) {
                lock_session(&slot).emit(ServerEvent::error(&err, frame_id));
            }
        }
    }

    pub fn initialize(
        &self,
        session_id: &str,
        payload: InitializePayload,
    ) -> Result<(), StreamError> {
        let slot = self.slot(session_id)?;
        let mut session = lock_session(&slot);
        session.touch(Instant::now());

        let limits = self.config.limits();
        let mut config = session
            .config
            .clone()
            .unwrap_or_else(|| SessionConfig::new(&limits));
        config.merge(&payload.config, &limits);

        if payload.client_id.is_some() {
            session.client_id = payload.client_id;
        }
        self.apply_smoothing_window(&mut session, config.smoothing_window);
        session.config = Some(config.clone());

        log::info!(
            "Session {session_id} ({}) initialized: {} fps, min face {}px, window {}",
            session.client_id().unwrap_or("anonymous client"),
            config.target_frame_rate,
            config.min_face_size,
            config.smoothing_window
        );
        session.emit(ServerEvent::Initialized(InitializedPayload {
            session_id: session_id.to_string(),
            timestamp: unix_timestamp(),
            config: EffectiveConfig {
                max_frame_rate: self.config.max_frame_rate,
                max_resolution: self.config.max_resolution,
                supported_actions: SUPPORTED_ACTIONS.iter().map(|a| a.to_string()).collect(),
                queue_capacity: self.config.queue_capacity,
                session: config,
            },
        }));
        Ok(())
    }

    pub fn control(&self, session_id: &str, payload: ControlPayload) -> Result<(), StreamError> {
        let slot = self.slot(session_id)?;
        let mut session = lock_session(&slot);
        let now = Instant::now();
        session.touch(now);

        let Some(current) = session.config.clone() else {
            return Err(StreamError::validation("Session not initialized"));
        };

        match payload.action.as_deref() {
            Some("start") => {
                if session.state != SessionState::Processing {
                    if let Identity::Guest(guest_id) = session.identity() {
                        if !self.guest_quota.try_acquire(guest_id, now) {
                            let status = self.guest_quota.remaining(guest_id, now);
                            return Err(StreamError::QuotaExceeded(format!(
                                "Guest usage limit of {} requests reached; resets in {}s",
                                status.total, status.reset
                            )));
                        }
                    }
                    session.start();
                    self.registry.mark_processing();
                    self.apply_smoothing_window(&mut session, current.smoothing_window);
                    log::info!("Session {session_id}: processing started");
                }
                session.emit(ServerEvent::status("Processing started"));
            }
            Some("stop") => {
                if session.state == SessionState::Processing {
                    session.stop();
                    self.registry.mark_not_processing();
                    log::info!("Session {session_id}: processing stopped");
                }
                session.emit(ServerEvent::status("Processing stopped"));
            }
            Some("configure") => {
                if let Some(proposal) = &payload.config {
                    let mut updated = current;
                    updated.merge(proposal, &self.config.limits());
                    self.apply_smoothing_window(&mut session, updated.smoothing_window);
                    session.config = Some(updated);
                }
                session.emit(ServerEvent::status("Configuration updated"));
            }
            Some(other) => {
                return Err(StreamError::validation(format!("Unknown action: {other}")));
            }
            None => return Err(StreamError::validation("Missing action")),
        }
        Ok(())
    }

    /// Validates, decodes, and queues one frame, scheduling the session on
    /// the worker pool if it has no frame in flight.
    pub fn video_frame(
        &self,
        session_id: &str,
        payload: VideoFramePayload,
    ) -> Result<(), StreamError> {
        let slot = self.slot(session_id)?;
        let now = Instant::now();

        let (frame_id, generation) = {
            let mut session = lock_session(&slot);
            session.touch(now);
            if session.state != SessionState::Processing {
                return Err(StreamError::validation("Processing not started"));
            }
            let frame_id = payload
                .frame_id
                .ok_or_else(|| StreamError::validation("Missing frame_id"))?;
            session.check_frame_order(frame_id)?;
            (frame_id, session.generation)
        };

        let data = payload
            .data
            .as_deref()
            .ok_or_else(|| StreamError::validation("No image data provided"))?;
        let decoded = self.decoder.decode(data, frame_id)?;

        let mut session = lock_session(&slot);
        if session.state != SessionState::Processing {
            return Err(StreamError::validation("Processing not started"));
        }
        if session.generation != generation {
            return Err(StreamError::validation(
                "Processing restarted while the frame was decoding",
            ));
        }
        session.check_frame_order(frame_id)?;

        session.enqueue(
            QueuedFrame {
                frame: decoded.frame,
                scale: decoded.scale,
                timestamp: payload.timestamp,
            },
            now,
        );

        if !session.busy {
            session.busy = true;
            if !self.pool.schedule(session_id.to_string()) {
                session.busy = false;
                return Err(StreamError::ServiceUnavailable(
                    "Frame workers are not running".into(),
                ));
            }
        }

        let target = session
            .config
            .as_ref()
            .map_or(self.config.max_frame_rate, |c| c.target_frame_rate);
        let processing = self.registry.processing_sessions();
        if let Some(recommended) = self.rate.assess(&mut session.rate, target, processing, now) {
            let hint = StreamError::RateLimited {
                message: format!("Server is busy; reduce frame rate to {recommended} fps"),
                recommended,
            };
            session.emit(ServerEvent::error(&hint, Some(frame_id)));
        }
        Ok(())
    }

    /// Closes a session from any state. In-flight work is discarded, the
    /// queue is drained and tracker state released. Returns false if the
    /// session was already gone.
    pub fn disconnect(&self, session_id: &str) -> bool {
        let Some(slot) = self.registry.remove(session_id) else {
            return false;
        };
        let mut session = lock_session(&slot);
        if session.state == SessionState::Processing {
            self.registry.mark_not_processing();
        }
        session.close();
        log::info!(
            "Session {session_id} disconnected after {:.1}s ({} processed, {} dropped)",
            session.age(Instant::now()).as_secs_f64(),
            session.stats.processed_frames,
            session.stats.dropped_frames
        );
        true
    }

    pub fn reap_idle(&self) -> Vec<SessionId> {
        self.reap_idle_at(Instant::now())
    }

    /// Closes sessions with no inbound activity for `idle_timeout_secs`.
    pub fn reap_idle_at(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.config.idle_timeout();
        let stale: Vec<(SessionId, SessionSlot)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|(_, slot)| lock_session(slot).idle_for(now) >= timeout)
            .collect();

        for (id, slot) in &stale {
            lock_session(slot).emit(ServerEvent::status("Session closed due to inactivity"));
            if self.disconnect(id) {
                log::info!("Session {id} reaped after inactivity");
            }
            lock_session(slot).close_transport();
        }
        self.guest_quota.prune_expired(now);
        stale.into_iter().map(|(id, _)| id).collect()
    }

    pub fn guest_status(&self, guest_id: &str) -> QuotaStatus {
        self.guest_quota.remaining(guest_id, Instant::now())
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.registry
            .get(session_id)
            .map(|slot| lock_session(&slot).state())
    }

    pub fn queue_depth(&self, session_id: &str) -> Option<usize> {
        self.registry
            .get(session_id)
            .map(|slot| lock_session(&slot).queue.len())
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Closes every session and stops the worker pool.
    pub fn shutdown(&self) {
        for (id, slot) in self.registry.snapshot() {
            self.disconnect(&id);
            lock_session(&slot).close_transport();
        }
        self.pool.shutdown();
    }

    fn slot(&self, session_id: &str) -> Result<SessionSlot, StreamError> {
        self.registry
            .get(session_id)
            .ok_or_else(|| StreamError::validation(format!("Unknown session: {session_id}")))
    }

    /// Resizes the smoothing window, creating the pipeline if no worker
    /// currently holds it. A worker applies the window when handing it back.
    fn apply_smoothing_window(&self, session: &mut Session, window: usize) {
        match session.pipeline.as_mut() {
            Some(pipeline) => pipeline.set_smoothing_window(window),
            None if !session.busy => session.pipeline = Some((self.new_pipeline)(window)),
            None => {}
        }
    }
}
