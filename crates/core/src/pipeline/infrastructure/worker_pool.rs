use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::pipeline::frame_processor::{FrameOutcome, FrameProcessor, SessionPipeline};
use crate::pipeline::rate_controller::PoolLatency;
use crate::protocol::outbound::{unix_timestamp, DetectionPayload, ServerEvent, StatusPayload};
use crate::session::session::{SessionId, SessionState};
use crate::session::session_registry::{lock_session, SessionRegistry};
use crate::session::stream_error::StreamError;

/// Messages on the pool's shared ready channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    /// The session has queued frames and no frame in flight.
    Run(SessionId),
    Stop,
}

/// Builds a fresh per-session pipeline with the hub's tracker settings.
pub type PipelineFactory = Arc<dyn Fn(usize) -> SessionPipeline + Send + Sync>;

/// Everything a worker thread needs, shared by all workers.
pub struct WorkerContext {
    pub registry: Arc<SessionRegistry>,
    pub processor: FrameProcessor,
    pub latency: Arc<PoolLatency>,
    pub new_pipeline: PipelineFactory,
    pub metrics_interval: u64,
}

/// Fixed set of worker threads multiplexed over all sessions.
///
/// A session is scheduled by sending `Run(id)` while holding its lock and
/// setting its busy flag, so at most one token per session is ever live and
/// at most one of its frames is in flight.
pub struct WorkerPool {
    sender: Sender<WorkerCommand>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(size: usize, context: WorkerContext) -> Self {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<WorkerCommand>();
        let context = Arc::new(context);

        let handles = (0..size)
            .map(|index| spawn_worker(index, receiver.clone(), sender.clone(), context.clone()))
            .collect();
        log::info!("Started {size} frame workers");

        Self {
            sender,
            handles: Mutex::new(handles),
        }
    }

    pub fn schedule(&self, session_id: SessionId) -> bool {
        self.sender.send(WorkerCommand::Run(session_id)).is_ok()
    }

    /// Stops every worker after its current frame and joins the threads.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles.is_empty() {
            return;
        }
        for _ in 0..handles.len() {
            let _ = self.sender.send(WorkerCommand::Stop);
        }
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Frame worker exited with a panic");
            }
        }
        log::info!("Frame workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    index: usize,
    receiver: Receiver<WorkerCommand>,
    scheduler: Sender<WorkerCommand>,
    context: Arc<WorkerContext>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        log::debug!("Frame worker {index} started");
        for command in receiver {
            match command {
                WorkerCommand::Run(session_id) => {
                    run_turn(&context, &scheduler, &session_id);
                }
                WorkerCommand::Stop => break,
            }
        }
        log::debug!("Frame worker {index} stopped");
    })
}

/// Processes one queued frame of `session_id`, then either reschedules the
/// session or clears its busy flag.
fn run_turn(context: &WorkerContext, scheduler: &Sender<WorkerCommand>, session_id: &str) {
    let Some(slot) = context.registry.get(session_id) else {
        return;
    };

    let (queued, mut pipeline, config, generation) = {
        let mut session = lock_session(&slot);
        let next = match (session.state, session.config.clone()) {
            (SessionState::Processing, Some(config)) => session.queue.pop().map(|q| (q, config)),
            _ => None,
        };
        let Some((queued, config)) = next else {
            session.busy = false;
            return;
        };
        let pipeline = session
            .pipeline
            .take()
            .unwrap_or_else(|| (context.new_pipeline)(config.smoothing_window));
        (queued, pipeline, config, session.generation)
    };

    let frame_id = queued.frame_id();
    let is_cancelled = || {
        let session = lock_session(&slot);
        session.generation != generation || session.state != SessionState::Processing
    };

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        context
            .processor
            .process(&mut pipeline, &queued, &config, &is_cancelled)
    }));
    let elapsed = started.elapsed();

    let mut session = lock_session(&slot);
    let window = session
        .config
        .as_ref()
        .map_or(config.smoothing_window, |c| c.smoothing_window);
    if session.generation == generation && session.state == SessionState::Processing {
        match outcome {
            Ok(Ok(FrameOutcome::Completed(faces))) => {
                pipeline.set_smoothing_window(window);
                session.pipeline = Some(pipeline);
                context.latency.record(elapsed);
                session.stats.record_result(elapsed, Instant::now());

                let face_detected = faces.iter().any(|f| !f.fading);
                session.emit(ServerEvent::DetectionResult(DetectionPayload {
                    frame_id,
                    timestamp: queued.timestamp.or_else(|| Some(unix_timestamp())),
                    processing_time: elapsed.as_secs_f64(),
                    faces,
                    face_detected,
                }));

                let processed = session.stats.processed_frames;
                if context.metrics_interval > 0 && processed % context.metrics_interval == 0 {
                    let metrics = session.metrics();
                    session.emit(ServerEvent::Status(StatusPayload {
                        message: "Processing metrics".to_string(),
                        metrics: Some(metrics),
                    }));
                }
            }
            Ok(Ok(FrameOutcome::Cancelled)) => {
                session.pipeline = Some(pipeline);
            }
            Ok(Err(err)) => {
                log::warn!("Session {session_id}: frame {frame_id} failed: {err}");
                pipeline.set_smoothing_window(window);
                session.pipeline = Some(pipeline);
                session.emit(ServerEvent::error(&err, Some(frame_id)));
            }
            Err(_) => {
                log::error!("Session {session_id}: pipeline panicked on frame {frame_id}");
                session.pipeline = Some(rebuild_pipeline(context, &pipeline, window));
                let err = StreamError::Processing("Internal error while processing frame".into());
                session.emit(ServerEvent::error(&err, Some(frame_id)));
            }
        }
    } else if session.state != SessionState::Closed {
        // Stopped mid-frame while this worker held the pipeline.
        log::debug!("Session {session_id}: discarding stale result for frame {frame_id}");
        let mut pipeline = match outcome {
            Ok(_) => pipeline,
            Err(_) => rebuild_pipeline(context, &pipeline, window),
        };
        pipeline.reset();
        pipeline.set_smoothing_window(window);
        if session.pipeline.is_none() {
            session.pipeline = Some(pipeline);
        }
    } else {
        log::debug!("Session {session_id}: closed while frame {frame_id} was in flight");
    }

    if session.state == SessionState::Processing && !session.queue.is_empty() {
        if scheduler
            .send(WorkerCommand::Run(session_id.to_string()))
            .is_err()
        {
            session.busy = false;
        }
    } else {
        session.busy = false;
    }
}

/// Fresh pipeline after a panic. Track ids continue from the broken one.
fn rebuild_pipeline(
    context: &WorkerContext,
    broken: &SessionPipeline,
    window: usize,
) -> SessionPipeline {
    let mut fresh = (context.new_pipeline)(window);
    fresh.resume_tracking_ids(broken.next_tracking_id());
    fresh
}
