use std::collections::VecDeque;

use glam::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SortSchedulerConfig {
    /// View direction cosine at or below which a new sort is needed.
    pub min_sort_cosine: f32,
    /// Camera travel at or above which a new sort is needed.
    pub min_sort_distance: f32,
    pub dynamic_mode: bool,
}

impl Default for SortSchedulerConfig {
    fn default() -> Self {
        Self { min_sort_cosine: 0.99, min_sort_distance: 1.0, dynamic_mode: false }
    }
}

/// Decides when a camera change warrants a re-sort and spreads large view
/// changes over a few frames of progressively wider partial sorts.
#[derive(Debug, Default)]
pub struct SortScheduler {
    config: SortSchedulerConfig,
    last_position: Option<Vec3>,
    last_direction: Option<Vec3>,
    queue: VecDeque<f32>,
}

/// Fractions of the candidate list sorted on the frames before a full sort.
fn partial_fractions(cosine: f32) -> &'static [f32] {
    if cosine < 0.55 {
        &[0.125, 0.33333, 0.75]
    } else if cosine < 0.65 {
        &[0.33333, 0.66667]
    } else if cosine < 0.8 {
        &[0.5]
    } else {
        &[]
    }
}

impl SortScheduler {
    pub fn new(config: SortSchedulerConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_position = None;
        self.last_direction = None;
    }

    /// Called once per frame. Returns the fraction of the candidate list to
    /// sort now, or `None` when no sort is due.
    pub fn update(&mut self, camera_position: Vec3, camera_direction: Vec3, force: bool) -> Option<f32> {
        let direction = camera_direction.normalize_or_zero();
        let cosine = self.last_direction.map_or(-1.0, |last| direction.dot(last));

        if !force && !self.queue.is_empty() {
            return self.queue.pop_front();
        }
        if !force && !self.config.dynamic_mode {
            if let Some(last_position) = self.last_position {
                let moved = camera_position.distance(last_position);
                if cosine > self.config.min_sort_cosine && moved < self.config.min_sort_distance {
                    return None;
                }
            }
        }

        self.queue.clear();
        if !force && !self.config.dynamic_mode && self.last_direction.is_some() {
            self.queue.extend(partial_fractions(cosine));
        }
        self.queue.push_back(1.0);
        self.last_position = Some(camera_position);
        self.last_direction = Some(direction);
        log::trace!("Queued {} sorts at view cosine {:.3}", self.queue.len(), cosine);
        self.queue.pop_front()
    }
}

/// Number of candidates a fraction covers.
pub fn sort_count_for(fraction: f32, render_count: usize) -> usize {
    ((render_count as f32 * fraction).round() as usize).min(render_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_sorts_fully() {
        let mut scheduler = SortScheduler::default();
        assert_eq!(scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false), Some(1.0));
        assert_eq!(scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false), None);
    }

    #[test]
    fn test_small_changes_skip() {
        let mut scheduler = SortScheduler::new(SortSchedulerConfig::default());
        scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false);
        let nudged = Vec3::new(0.05, 0.0, -1.0);
        assert_eq!(scheduler.update(Vec3::new(0.5, 0.0, 0.0), nudged, false), None);
        assert_eq!(scheduler.update(Vec3::new(1.5, 0.0, 0.0), Vec3::NEG_Z, false), Some(1.0));
    }

    #[test]
    fn test_sharp_turn_queues_partials() {
        let mut scheduler = SortScheduler::default();
        scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false);
        let fractions: Vec<_> = std::iter::from_fn(|| scheduler.update(Vec3::ZERO, Vec3::X, false)).collect();
        assert_eq!(fractions, vec![0.125, 0.33333, 0.75, 1.0]);

        let turned = Vec3::new(1.0, 0.0, -1.0);
        let fractions: Vec<_> = std::iter::from_fn(|| scheduler.update(Vec3::ZERO, turned, false)).collect();
        assert_eq!(fractions, vec![0.5, 1.0]);
    }

    #[test]
    fn test_force_and_dynamic_sort_fully() {
        let mut scheduler = SortScheduler::default();
        scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false);
        assert_eq!(scheduler.update(Vec3::ZERO, Vec3::X, true), Some(1.0));
        assert_eq!(scheduler.queued(), 0);

        let mut dynamic = SortScheduler::new(SortSchedulerConfig { dynamic_mode: true, ..Default::default() });
        assert_eq!(dynamic.update(Vec3::ZERO, Vec3::NEG_Z, false), Some(1.0));
        assert_eq!(dynamic.update(Vec3::ZERO, Vec3::NEG_Z, false), Some(1.0));
    }

    #[test]
    fn test_sort_count_for() {
        assert_eq!(sort_count_for(0.125, 800), 100);
        assert_eq!(sort_count_for(1.0, 7), 7);
        assert_eq!(sort_count_for(0.5, 0), 0);
    }
}
