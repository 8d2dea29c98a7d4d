/// Per-session IoU face tracker.
///
/// Detections are associated with existing tracks by greedy IoU matching
/// (highest overlap first, each side used at most once). Tracks that go
/// unmatched are kept for a short grace period and reported as fading so a
/// momentary detector miss does not flip a face's identity.
use std::collections::HashSet;

use crate::shared::bounding_box::BoundingBox;
use crate::shared::constants::{DEFAULT_FADE_GRACE, DEFAULT_TRACK_IOU_THRESHOLD};

/// A face with a stable identity as reported for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedFace {
    pub tracking_id: u32,
    pub bbox: BoundingBox,
    pub last_seen_frame: u64,
    pub fading: bool,
    /// Index into the detections passed to `update`; `None` when fading.
    pub det_index: Option<usize>,
}

/// Outcome of one tracker step.
#[derive(Clone, Debug, Default)]
pub struct TrackUpdate {
    /// Detected faces in detection order, followed by fading tracks.
    pub faces: Vec<TrackedFace>,
    /// Ids discarded this step; their smoothing history should be released.
    pub retired: Vec<u32>,
}

#[derive(Clone, Debug)]
struct TrackState {
    id: u32,
    bbox: BoundingBox,
    last_seen_frame: u64,
    frames_unmatched: usize,
    det_index: Option<usize>,
}

pub struct FaceTracker {
    tracks: Vec<TrackState>,
    next_id: u32,
    iou_threshold: f64,
    grace: usize,
}

impl FaceTracker {
    pub fn new(iou_threshold: f64, grace: usize) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            grace,
        }
    }

    pub fn update(&mut self, detections: &[BoundingBox], frame_id: u64) -> TrackUpdate {
        for track in &mut self.tracks {
            track.det_index = None;
        }

        let matched_dets = self.match_existing(detections, frame_id);
        let num_existing = self.tracks.len();
        self.create_new_tracks(detections, &matched_dets, frame_id);
        let retired = self.age_unmatched_tracks(num_existing);

        TrackUpdate {
            faces: self.report(),
            retired,
        }
    }

    /// Drops every track. Ids keep counting up so a restarted stream never
    /// reuses an id the client may still be drawing.
    pub fn reset(&mut self) -> Vec<u32> {
        self.tracks.drain(..).map(|t| t.id).collect()
    }

    /// Id the next new track will receive.
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Continues numbering from `next_id` unless this tracker is already past it.
    pub fn resume_ids_from(&mut self, next_id: u32) {
        self.next_id = self.next_id.max(next_id);
    }

    /// Number of tracks currently held, fading ones included.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn match_existing(&mut self, detections: &[BoundingBox], frame_id: u64) -> HashSet<usize> {
        let track_boxes: Vec<BoundingBox> = self.tracks.iter().map(|t| t.bbox).collect();
        let mut matched = HashSet::new();
        for (ti, di) in greedy_match(&track_boxes, detections, self.iou_threshold) {
            let track = &mut self.tracks[ti];
            track.bbox = detections[di];
            track.last_seen_frame = frame_id;
            track.frames_unmatched = 0;
            track.det_index = Some(di);
            matched.insert(di);
        }
        matched
    }

    fn create_new_tracks(
        &mut self,
        detections: &[BoundingBox],
        matched: &HashSet<usize>,
        frame_id: u64,
    ) {
        for (di, bbox) in detections.iter().enumerate() {
            if matched.contains(&di) {
                continue;
            }
            self.tracks.push(TrackState {
                id: self.next_id,
                bbox: *bbox,
                last_seen_frame: frame_id,
                frames_unmatched: 0,
                det_index: Some(di),
            });
            self.next_id += 1;
        }
    }

    fn age_unmatched_tracks(&mut self, num_existing: usize) -> Vec<u32> {
        for track in self.tracks.iter_mut().take(num_existing) {
            if track.det_index.is_none() {
                track.frames_unmatched += 1;
            }
        }
        let grace = self.grace;
        let mut retired = Vec::new();
        self.tracks.retain(|t| {
            let keep = t.frames_unmatched <= grace;
            if !keep {
                retired.push(t.id);
            }
            keep
        });
        retired
    }

    fn report(&self) -> Vec<TrackedFace> {
        let mut detected: Vec<TrackedFace> = Vec::new();
        let mut fading: Vec<TrackedFace> = Vec::new();
        for t in &self.tracks {
            let face = TrackedFace {
                tracking_id: t.id,
                bbox: t.bbox,
                last_seen_frame: t.last_seen_frame,
                fading: t.det_index.is_none(),
                det_index: t.det_index,
            };
            if face.fading {
                fading.push(face);
            } else {
                detected.push(face);
            }
        }
        detected.sort_by_key(|f| f.det_index);
        detected.extend(fading);
        detected
    }
}

impl Default for FaceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_IOU_THRESHOLD, DEFAULT_FADE_GRACE)
    }
}

/// Greedy IoU matching: candidate pairs sorted by descending IoU, each track
/// and detection used at most once. Only pairs strictly above `thresh` count.
fn greedy_match(
    tracks: &[BoundingBox],
    detections: &[BoundingBox],
    thresh: f64,
) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
    for (ti, track) in tracks.iter().enumerate() {
        for (di, det) in detections.iter().enumerate() {
            let score = track.iou(det);
            if score > thresh {
                pairs.push((ti, di, score));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_tracks = HashSet::new();
    let mut used_dets = HashSet::new();
    let mut matches = Vec::new();
    for (ti, di, _) in pairs {
        if !used_tracks.contains(&ti) && !used_dets.contains(&di) {
            used_tracks.insert(ti);
            used_dets.insert(di);
            matches.push((ti, di));
        }
    }
    matches
}
