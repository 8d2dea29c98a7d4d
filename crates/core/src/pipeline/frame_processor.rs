use std::sync::Arc;

use crate::detection::domain::emotion::rank;
use crate::detection::infrastructure::model_handles::ModelHandles;
use crate::protocol::outbound::FaceResult;
use crate::session::frame_queue::QueuedFrame;
use crate::session::session_config::SessionConfig;
use crate::session::stream_error::StreamError;
use crate::shared::bounding_box::BoundingBox;
use crate::tracking::emotion_smoother::EmotionSmoother;
use crate::tracking::face_tracker::FaceTracker;

/// Mutable per-session state the pipeline carries from frame to frame.
///
/// A worker takes it out of the session for the duration of one frame and
/// hands it back afterwards, so it is never shared between threads.
pub struct SessionPipeline {
    tracker: FaceTracker,
    smoother: EmotionSmoother,
    frames_seen: u64,
    last_boxes: Vec<BoundingBox>,
}

impl SessionPipeline {
    pub fn new(tracker: FaceTracker, smoother: EmotionSmoother) -> Self {
        Self {
            tracker,
            smoother,
            frames_seen: 0,
            last_boxes: Vec::new(),
        }
    }

    pub fn set_smoothing_window(&mut self, window: usize) {
        if self.smoother.window() != window {
            self.smoother.set_window(window);
        }
    }

    /// Forgets every face and restarts the detection cadence.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.smoother.clear();
        self.frames_seen = 0;
        self.last_boxes.clear();
    }

    pub fn next_tracking_id(&self) -> u32 {
        self.tracker.next_id()
    }

    /// Makes new faces continue the numbering of a replaced pipeline.
    pub fn resume_tracking_ids(&mut self, next_id: u32) {
        self.tracker.resume_ids_from(next_id);
    }

    /// Faces currently tracked, fading ones included.
    pub fn tracking_faces(&self) -> usize {
        self.tracker.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Completed(Vec<FaceResult>),
    /// The session stopped or closed mid-frame; nothing may be emitted.
    Cancelled,
}

/// Runs detect → filter → crop → classify → track → smooth for one frame.
pub struct FrameProcessor {
    models: Arc<ModelHandles>,
}

impl FrameProcessor {
    pub fn new(models: Arc<ModelHandles>) -> Self {
        Self { models }
    }

    /// Processes `queued` against `pipeline`.
    ///
    /// `is_cancelled` is polled between steps; once it reports true the
    /// frame is abandoned with `FrameOutcome::Cancelled`.
    pub fn process(
        &self,
        pipeline: &mut SessionPipeline,
        queued: &QueuedFrame,
        config: &SessionConfig,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<FrameOutcome, StreamError> {
        let frame = &queued.frame;
        let interval = config.detection_interval.max(1) as u64;
        let run_detection = pipeline.frames_seen % interval == 0;
        pipeline.frames_seen += 1;

        let boxes = if run_detection {
            let detected = match self.models.detect(frame) {
                Ok(detected) => detected,
                Err(err) => {
                    pipeline.last_boxes.clear();
                    return Err(err.into());
                }
            };
            // min_face_size is in client pixels; boxes are still in processing pixels.
            let min_side = config.min_face_size as f64 / queued.scale;
            let kept: Vec<BoundingBox> = detected
                .iter()
                .filter_map(|b| b.clamped(frame.width(), frame.height()))
                .filter(|b| b.min_side() as f64 >= min_side)
                .collect();
            log::debug!(
                "Frame {}: {} faces detected, {} kept",
                frame.frame_id(),
                detected.len(),
                kept.len()
            );
            pipeline.last_boxes = kept.clone();
            kept
        } else {
            pipeline.last_boxes.clone()
        };

        if is_cancelled() {
            return Ok(FrameOutcome::Cancelled);
        }

        let mut scores = Vec::with_capacity(boxes.len());
        for bbox in &boxes {
            let crop = frame.crop(bbox).ok_or_else(|| {
                StreamError::Processing(format!("Face box {bbox:?} lies outside the frame"))
            })?;
            scores.push(self.models.classify(&crop)?);
        }

        if is_cancelled() {
            return Ok(FrameOutcome::Cancelled);
        }

        let update = pipeline.tracker.update(&boxes, frame.frame_id());
        for id in &update.retired {
            pipeline.smoother.release(*id);
        }

        let labels = self.models.labels();
        let mut faces = Vec::with_capacity(update.faces.len());
        for face in &update.faces {
            let smoothed = match face.det_index {
                Some(di) => pipeline.smoother.update(face.tracking_id, &scores[di]),
                None => pipeline
                    .smoother
                    .current(face.tracking_id)
                    .unwrap_or_default(),
            };
            faces.push(FaceResult {
                bbox: face.bbox.scaled(queued.scale),
                tracking_id: face.tracking_id,
                emotions: rank(labels, &smoothed),
                fading: face.fading,
            });
        }

        Ok(FrameOutcome::Completed(faces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::emotion_classifier::EmotionClassifier;
    use crate::detection::domain::face_detector::FaceDetector;
    use crate::detection::domain::inference_error::InferenceError;
    use crate::session::session_config::ConfigLimits;
    use crate::shared::frame::Frame;
    use approx::assert_relative_eq;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns one scripted box list per call, repeating the last.
    struct ScriptedDetector {
        script: Mutex<Vec<Vec<BoundingBox>>>,
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl ScriptedDetector {
        fn new(script: Vec<Vec<BoundingBox>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }

        /// Makes the `call`-th detection (zero based) fail.
        fn failing_on(mut self, call: usize) -> Self {
            self.fail_on = Some(call);
            self
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(InferenceError::Failed("detector crashed".into()));
            }
            let script = self.script.lock().unwrap();
            Ok(script[n.min(script.len() - 1)].clone())
        }
    }

    /// Scores the crop by its mean red value: `[red, 1 - red]`.
    struct RednessClassifier {
        labels: Vec<String>,
    }

    impl EmotionClassifier for RednessClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn classify(&self, face: &Frame) -> Result<Vec<f32>, InferenceError> {
            let px = face.data().chunks(3).count().max(1);
            let red: u32 = face.data().chunks(3).map(|p| p[0] as u32).sum();
            let r = red as f32 / px as f32 / 255.0;
            Ok(vec![r, 1.0 - r])
        }
    }

    struct FailingClassifier;

    impl EmotionClassifier for FailingClassifier {
        fn labels(&self) -> &[String] {
            &[]
        }

        fn classify(&self, _face: &Frame) -> Result<Vec<f32>, InferenceError> {
            Err(InferenceError::Unavailable("offline".into()))
        }
    }

    fn processor(detector: ScriptedDetector) -> FrameProcessor {
        let classifier = RednessClassifier {
            labels: vec!["angry".into(), "calm".into()],
        };
        FrameProcessor::new(Arc::new(ModelHandles::new(
            Arc::new(detector),
            Arc::new(classifier),
        )))
    }

    fn queued(frame_id: u64, red: u8) -> QueuedFrame {
        let mut data = Vec::with_capacity(200 * 200 * 3);
        for _ in 0..200 * 200 {
            data.extend_from_slice(&[red, 0, 0]);
        }
        QueuedFrame {
            frame: Frame::new(data, 200, 200, 3, frame_id),
            scale: 1.0,
            timestamp: None,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(&ConfigLimits::default())
    }

    fn pipeline() -> SessionPipeline {
        SessionPipeline::new(FaceTracker::default(), EmotionSmoother::new(3))
    }

    fn completed(outcome: FrameOutcome) -> Vec<FaceResult> {
        match outcome {
            FrameOutcome::Completed(faces) => faces,
            FrameOutcome::Cancelled => panic!("frame was cancelled"),
        }
    }

    fn never() -> bool {
        false
    }

    #[test]
    fn test_faces_are_ranked_and_tracked() {
        let proc = processor(ScriptedDetector::new(vec![vec![BoundingBox::new(
            10, 10, 100, 100,
        )]]));
        let mut state = pipeline();

        let faces = completed(proc.process(&mut state, &queued(1, 255), &config(), &never).unwrap());
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].tracking_id, 1);
        assert_eq!(faces[0].emotions[0].emotion, "angry");
        assert_relative_eq!(faces[0].emotions[0].percentage, 100.0);
        assert!(!faces[0].fading);
    }

    #[test]
    fn test_small_faces_are_filtered() {
        let proc = processor(ScriptedDetector::new(vec![vec![
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(50, 50, 80, 80),
        ]]));
        let mut state = pipeline();

        let faces = completed(proc.process(&mut state, &queued(1, 0), &config(), &never).unwrap());
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox::new(50, 50, 80, 80));
    }

    #[test]
    fn test_boxes_are_scaled_to_client_pixels() {
        let proc = processor(ScriptedDetector::new(vec![vec![BoundingBox::new(
            10, 20, 100, 100,
        )]]));
        let mut state = pipeline();
        let mut frame = queued(1, 0);
        frame.scale = 2.0;

        let faces = completed(proc.process(&mut state, &frame, &config(), &never).unwrap());
        assert_eq!(faces[0].bbox, BoundingBox::new(20, 40, 200, 200));
    }

    #[test]
    fn test_min_face_size_is_in_client_pixels() {
        // 40px in a half-size frame is 80px to the client, over the 64px default.
        let proc = processor(ScriptedDetector::new(vec![vec![
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(100, 100, 40, 40),
        ]]));
        let mut state = pipeline();
        let mut frame = queued(1, 0);
        frame.scale = 2.0;

        let faces = completed(proc.process(&mut state, &frame, &config(), &never).unwrap());
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox::new(200, 200, 80, 80));
    }

    #[test]
    fn test_scores_are_smoothed_over_window() {
        let face = BoundingBox::new(10, 10, 100, 100);
        let proc = processor(ScriptedDetector::new(vec![vec![face]]));
        let mut state = pipeline();

        proc.process(&mut state, &queued(1, 255), &config(), &never).unwrap();
        let faces = completed(proc.process(&mut state, &queued(2, 0), &config(), &never).unwrap());

        // mean of [1, 0] and [0, 1]
        assert_relative_eq!(faces[0].emotions[0].score, 0.5);
    }

    #[test]
    fn test_detection_interval_reuses_boxes() {
        let detector = ScriptedDetector::new(vec![vec![BoundingBox::new(10, 10, 100, 100)]]);
        let classifier = RednessClassifier {
            labels: vec!["angry".into(), "calm".into()],
        };
        let detector = Arc::new(detector);
        let models = Arc::new(ModelHandles::new(detector.clone(), Arc::new(classifier)));
        let proc = FrameProcessor::new(models);
        let mut state = pipeline();
        let mut cfg = config();
        cfg.detection_interval = 3;

        for id in 1..=4 {
            let faces = completed(proc.process(&mut state, &queued(id, 0), &cfg, &never).unwrap());
            assert_eq!(faces.len(), 1);
            assert_eq!(faces[0].tracking_id, 1);
        }
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_detection_forgets_reused_boxes() {
        let detector =
            ScriptedDetector::new(vec![vec![BoundingBox::new(10, 10, 100, 100)]]).failing_on(1);
        let proc = processor(detector);
        let mut state = pipeline();
        let mut cfg = config();
        cfg.detection_interval = 2;

        let faces = completed(proc.process(&mut state, &queued(1, 0), &cfg, &never).unwrap());
        assert_eq!(faces.len(), 1);
        proc.process(&mut state, &queued(2, 0), &cfg, &never).unwrap();
        assert!(proc.process(&mut state, &queued(3, 0), &cfg, &never).is_err());

        // Frame 4 is not a detection frame and must not reuse frame 1's box.
        let faces = completed(proc.process(&mut state, &queued(4, 0), &cfg, &never).unwrap());
        assert!(faces.iter().all(|f| f.fading));
    }

    #[test]
    fn test_missing_face_is_reported_fading_with_last_emotions() {
        let proc = processor(ScriptedDetector::new(vec![
            vec![BoundingBox::new(10, 10, 100, 100)],
            vec![],
        ]));
        let mut state = pipeline();

        proc.process(&mut state, &queued(1, 255), &config(), &never).unwrap();
        let faces = completed(proc.process(&mut state, &queued(2, 0), &config(), &never).unwrap());

        assert_eq!(faces.len(), 1);
        assert!(faces[0].fading);
        assert_eq!(faces[0].emotions[0].emotion, "angry");
    }

    #[test]
    fn test_cancellation_is_observed_before_classification() {
        let proc = processor(ScriptedDetector::new(vec![vec![BoundingBox::new(
            10, 10, 100, 100,
        )]]));
        let mut state = pipeline();
        let polls = Cell::new(0);
        let cancel_now = || {
            polls.set(polls.get() + 1);
            true
        };

        let outcome = proc
            .process(&mut state, &queued(1, 0), &config(), &cancel_now)
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Cancelled);
        assert_eq!(polls.get(), 1);
        assert_eq!(state.tracking_faces(), 0);
    }

    #[test]
    fn test_unavailable_classifier_maps_to_503() {
        let detector = ScriptedDetector::new(vec![vec![BoundingBox::new(10, 10, 100, 100)]]);
        let models = Arc::new(ModelHandles::new(
            Arc::new(detector),
            Arc::new(FailingClassifier),
        ));
        let proc = FrameProcessor::new(models);

        let err = proc
            .process(&mut pipeline(), &queued(1, 0), &config(), &never)
            .unwrap_err();
        assert_eq!(err.code(), 503);
    }

    #[test]
    fn test_reset_clears_tracks() {
        let proc = processor(ScriptedDetector::new(vec![vec![BoundingBox::new(
            10, 10, 100, 100,
        )]]));
        let mut state = pipeline();
        proc.process(&mut state, &queued(1, 0), &config(), &never).unwrap();
        assert_eq!(state.tracking_faces(), 1);

        state.reset();
        assert_eq!(state.tracking_faces(), 0);
    }

    #[test]
    fn test_replacement_pipeline_continues_ids() {
        let proc = processor(ScriptedDetector::new(vec![vec![BoundingBox::new(
            10, 10, 100, 100,
        )]]));
        let mut broken = pipeline();
        proc.process(&mut broken, &queued(1, 0), &config(), &never).unwrap();

        let mut fresh = pipeline();
        fresh.resume_tracking_ids(broken.next_tracking_id());
        let faces = completed(proc.process(&mut fresh, &queued(2, 0), &config(), &never).unwrap());
        assert_eq!(faces[0].tracking_id, 2);
    }
}
