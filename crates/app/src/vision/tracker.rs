//! Nearest-centroid track identity management.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;
use image::{Rgba, RgbaImage};
use video_ingest::Frame;

use crate::vision::{annotation, data::BoundingBox};

/// Maximum centroid distance for a box to claim an existing track.
const DISTANCE_THRESHOLD: f64 = 120.0;
/// Consecutive unmatched updates before a track is retired.
const MAX_FRAMES_LOST: u32 = 30;

const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TRAIL_COLOR: Rgba<u8> = Rgba([255, 128, 0, 255]);
const ID_COLOR: Rgba<u8> = Rgba([0, 255, 255, 255]);

struct Track {
    history: VecDeque<(i32, i32)>,
    frames_lost: u32,
}

/// Correlates regions across frames by centroid proximity, owned exclusively
/// by the producer thread.
pub struct TrackManager {
    tracks: BTreeMap<i64, Track>,
    next_id: i64,
    max_history: usize,
}

impl TrackManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            max_history,
        }
    }

    /// Assign track identities to this frame's boxes, in the order given.
    ///
    /// Greedy single-pass nearest-neighbour: each box takes the closest live
    /// track within [`DISTANCE_THRESHOLD`] of its centroid, lowest id winning
    /// ties. Two boxes may claim the same track in one frame; the first
    /// processed appends its centroid first. Tracks nothing claimed for
    /// [`MAX_FRAMES_LOST`] consecutive updates are retired.
    pub fn update_tracks(&mut self, boxes: &mut [BoundingBox]) {
        let mut matched = BTreeSet::new();

        for bx in boxes.iter_mut() {
            let center = bx.centroid();
            let track_id = match self.match_track(center) {
                Some(id) => id,
                None => self.create_track(),
            };
            if let Some(track) = self.tracks.get_mut(&track_id) {
                push_bounded(&mut track.history, center, self.max_history);
                track.frames_lost = 0;
            }
            matched.insert(track_id);
            bx.track_id = Some(track_id);
        }

        self.tracks.retain(|id, track| {
            if matched.contains(id) {
                return true;
            }
            track.frames_lost += 1;
            track.frames_lost < MAX_FRAMES_LOST
        });
    }

    fn match_track(&self, center: (i32, i32)) -> Option<i64> {
        let mut min_distance = f64::INFINITY;
        let mut closest = None;
        for (id, track) in &self.tracks {
            let Some(&(last_x, last_y)) = track.history.back() else {
                continue;
            };
            let dx = f64::from(center.0 - last_x);
            let dy = f64::from(center.1 - last_y);
            let distance = (dx * dx + dy * dy).sqrt();
            if distance < min_distance && distance <= DISTANCE_THRESHOLD {
                min_distance = distance;
                closest = Some(*id);
            }
        }
        closest
    }

    fn create_track(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(
            id,
            Track {
                history: VecDeque::with_capacity(self.max_history),
                frames_lost: 0,
            },
        );
        id
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Draw boxes, labels, and track trails onto a fresh image buffer.
    ///
    /// The input frame is never mutated. Trails and id labels are drawn only
    /// for boxes whose track id is still live in this manager.
    pub fn draw_annotations(&self, frame: &Frame, boxes: &[BoundingBox]) -> Result<RgbaImage> {
        let mut image = annotation::frame_to_rgba(frame)?;

        for bx in boxes {
            annotation::draw_rectangle(
                &mut image,
                bx.x,
                bx.y,
                bx.x + bx.width,
                bx.y + bx.height,
                BOX_COLOR,
            );

            let label = format!("{} {:.2}", bx.label, bx.confidence);
            annotation::draw_label(&mut image, bx.x, (bx.y - 10).max(0), &label, BOX_COLOR);

            let Some(track_id) = bx.track_id else {
                continue;
            };
            let Some(track) = self.tracks.get(&track_id) else {
                continue;
            };

            let mut trail = track.history.iter();
            if let Some(mut previous) = trail.next().copied() {
                for &point in trail {
                    annotation::draw_line(
                        &mut image,
                        previous.0,
                        previous.1,
                        point.0,
                        point.1,
                        TRAIL_COLOR,
                    );
                    previous = point;
                }
            }
            annotation::draw_label(
                &mut image,
                bx.x,
                bx.y + bx.height + 15,
                &format!("ID {track_id}"),
                ID_COLOR,
            );
        }

        Ok(image)
    }
}

fn push_bounded(history: &mut VecDeque<(i32, i32)>, point: (i32, i32), cap: usize) {
    if cap == 0 {
        return;
    }
    if history.len() == cap {
        history.pop_front();
    }
    history.push_back(point);
}
