//! Depth ordering of splat candidates with a bounded counting sort.

pub mod scheduler;
pub mod worker;

use anyhow::anyhow;
use glam::{Mat4, Vec3, Vec4};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

pub use scheduler::{SortScheduler, SortSchedulerConfig};
pub use worker::{OwnedDistances, SortJob, SortReply, SortRequest, SortWorker};

/// Fixed-point scale for integer depth mode.
pub const INTEGER_DEPTH_SCALE: f32 = 1000.0;
pub const MAX_PRECISION_BITS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SorterConfig {
    pub max_splat_count: usize,
    /// Histogram has `2^precision_bits` bins.
    pub precision_bits: u32,
    pub integer_sort: bool,
    /// Depths use a per-scene transform picked by each splat's scene index.
    pub dynamic_mode: bool,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self { max_splat_count: 0, precision_bits: 16, integer_sort: true, dynamic_mode: false }
    }
}

/// Depths computed elsewhere, indexed by splat.
#[derive(Debug, Clone, Copy)]
pub enum Distances<'a> {
    Float(&'a [f32]),
    Int(&'a [i32]),
}

#[derive(Debug, Clone)]
pub struct SortParams<'a> {
    pub view_proj: Mat4,
    /// Candidate splat indices. Only the first `render_count` are used.
    pub indexes_to_sort: &'a [u32],
    pub render_count: usize,
    /// Sort the last `sort_count` candidates; the rest pass through.
    pub sort_count: usize,
    pub precomputed: Option<Distances<'a>>,
}

/// Depth values that can be mapped onto histogram bins.
trait Depth: Copy + PartialOrd {
    fn as_f64(self) -> f64;
}

impl Depth for f32 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Depth for i64 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

/// Owns every buffer a sort needs, sized once for `max_splat_count`.
#[derive(Debug, Default)]
pub struct DistanceSorter {
    config: SorterConfig,
    centers: Vec<Vec4>,
    int_centers: Vec<[i32; 4]>,
    scene_indexes: Vec<u32>,
    transforms: Vec<Mat4>,
    float_depths: Vec<f32>,
    int_depths: Vec<i64>,
    bins: Vec<u32>,
    counts: Vec<u32>,
    sorted: Vec<u32>,
}

impl DistanceSorter {
    pub fn new(config: SorterConfig) -> anyhow::Result<Self> {
        if config.precision_bits == 0 || config.precision_bits > MAX_PRECISION_BITS {
            return Err(anyhow!("Invalid sort precision: {} bits", config.precision_bits));
        }
        let n = config.max_splat_count;
        log::debug!(
            "Sorter for {} splats, {} bits, integer {}, dynamic {}",
            n,
            config.precision_bits,
            config.integer_sort,
            config.dynamic_mode
        );
        Ok(Self {
            float_depths: vec![0.0; if config.integer_sort { 0 } else { n }],
            int_depths: vec![0; if config.integer_sort { n } else { 0 }],
            bins: vec![0; n],
            counts: vec![0; 1 << config.precision_bits],
            sorted: vec![0; n],
            centers: Vec::new(),
            int_centers: Vec::new(),
            scene_indexes: Vec::new(),
            transforms: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn splat_count(&self) -> usize {
        self.centers.len().max(self.int_centers.len())
    }

    /// Upload centers, 3 or 4 components per splat (the 4th is ignored).
    pub fn set_centers(&mut self, centers: &[f32], components: usize) -> anyhow::Result<()> {
        if !(3..=4).contains(&components) || centers.len() % components != 0 {
            return Err(anyhow!("Center data must be 3 or 4 components per splat"));
        }
        let count = centers.len() / components;
        if count > self.config.max_splat_count {
            return Err(anyhow!("{} centers exceed sorter capacity {}", count, self.config.max_splat_count));
        }
        let points = centers.chunks_exact(components).map(|c| Vec3::new(c[0], c[1], c[2]));
        if self.config.integer_sort {
            self.int_centers = points
                .map(|p| {
                    let [x, y, z] = (p * INTEGER_DEPTH_SCALE).round().to_array().map(|v| v as i32);
                    // w shares the scale so row translations weigh like positions.
                    [x, y, z, INTEGER_DEPTH_SCALE as i32]
                })
                .collect();
        } else {
            self.centers = points.map(|p| p.extend(1.0)).collect();
        }
        Ok(())
    }

    pub fn set_scene_indexes(&mut self, scene_indexes: &[u32]) {
        self.scene_indexes = scene_indexes.to_vec();
    }

    pub fn set_transforms(&mut self, transforms: &[Mat4]) {
        self.transforms = transforms.to_vec();
    }

    /// Returns the first `render_count` entries of the ordering: the
    /// unsorted head followed by the sorted tail, nearest depth first.
    pub fn sort(&mut self, params: &SortParams) -> anyhow::Result<&[u32]> {
        let render_count = params.render_count;
        if render_count > params.indexes_to_sort.len() || render_count > self.config.max_splat_count {
            return Err(anyhow!(
                "Render count {} exceeds candidates {} or capacity {}",
                render_count,
                params.indexes_to_sort.len(),
                self.config.max_splat_count
            ));
        }
        let sort_count = params.sort_count.min(render_count);
        let sort_start = render_count - sort_count;
        let candidates = &params.indexes_to_sort[sort_start..render_count];
        self.sorted[..sort_start].copy_from_slice(&params.indexes_to_sort[..sort_start]);
        if sort_count == 0 {
            return Ok(&self.sorted[..render_count]);
        }
        if let Some(invalid) = candidates.iter().find(|i| **i as usize >= self.splat_limit(params)) {
            return Err(anyhow!("Candidate index {} has no center", invalid));
        }

        match params.precomputed {
            Some(Distances::Float(depths)) => {
                let depths = candidates.iter().map(|i| depths[*i as usize]);
                bin_depths(depths, &mut self.bins[..sort_count], self.counts.len());
            }
            Some(Distances::Int(depths)) => {
                let depths = candidates.iter().map(|i| depths[*i as usize] as i64);
                bin_depths(depths, &mut self.bins[..sort_count], self.counts.len());
            }
            None if self.config.integer_sort => {
                self.compute_int_depths(params.view_proj, candidates)?;
                let depths = self.int_depths[..sort_count].iter().copied();
                bin_depths(depths, &mut self.bins[..sort_count], self.counts.len());
            }
            None => {
                self.compute_float_depths(params.view_proj, candidates)?;
                let depths = self.float_depths[..sort_count].iter().copied();
                bin_depths(depths, &mut self.bins[..sort_count], self.counts.len());
            }
        }

        // Histogram, prefix sums, then a reverse scatter so equal bins keep input order.
        self.counts.fill(0);
        for bin in &self.bins[..sort_count] {
            self.counts[*bin as usize] += 1;
        }
        for i in 1..self.counts.len() {
            self.counts[i] += self.counts[i - 1];
        }
        let out = &mut self.sorted[sort_start..render_count];
        for (candidate, bin) in candidates.iter().zip(&self.bins[..sort_count]).rev() {
            let slot = &mut self.counts[*bin as usize];
            *slot -= 1;
            out[*slot as usize] = *candidate;
        }
        Ok(&self.sorted[..render_count])
    }

    fn splat_limit(&self, params: &SortParams) -> usize {
        match params.precomputed {
            Some(Distances::Float(d)) => d.len(),
            Some(Distances::Int(d)) => d.len(),
            None => self.splat_count(),
        }
    }

    fn depth_row(&self, view_proj: Mat4, splat: u32) -> anyhow::Result<Vec4> {
        if !self.config.dynamic_mode {
            let row = view_proj.row(2);
            return Ok(row.truncate().extend(0.0));
        }
        let scene = self.scene_indexes.get(splat as usize).copied().unwrap_or(0) as usize;
        let transform = self
            .transforms
            .get(scene)
            .ok_or_else(|| anyhow!("Missing transform for scene {}", scene))?;
        Ok((view_proj * *transform).row(2))
    }

    fn compute_float_depths(&mut self, view_proj: Mat4, candidates: &[u32]) -> anyhow::Result<()> {
        let static_row = (!self.config.dynamic_mode).then(|| self.depth_row(view_proj, 0)).transpose()?;
        for (slot, index) in candidates.iter().enumerate() {
            let row = match static_row {
                Some(row) => row,
                None => self.depth_row(view_proj, *index)?,
            };
            self.float_depths[slot] = self.centers[*index as usize].dot(row);
        }
        Ok(())
    }

    fn compute_int_depths(&mut self, view_proj: Mat4, candidates: &[u32]) -> anyhow::Result<()> {
        let to_int = |row: Vec4| (row * INTEGER_DEPTH_SCALE).round().to_array().map(|v| v as i64);
        let static_row = (!self.config.dynamic_mode)
            .then(|| self.depth_row(view_proj, 0).map(to_int))
            .transpose()?;
        for (slot, index) in candidates.iter().enumerate() {
            let row = match static_row {
                Some(row) => row,
                None => to_int(self.depth_row(view_proj, *index)?),
            };
            let center = self.int_centers[*index as usize];
            self.int_depths[slot] = center.iter().zip(row).map(|(c, r)| *c as i64 * r).sum();
        }
        Ok(())
    }
}

/// Map each depth to `floor((d - min) * (bins - 1) / (max - min))`.
fn bin_depths<D: Depth>(depths: impl Iterator<Item = D> + Clone, out: &mut [u32], bin_count: usize) {
    let Some((min, max)) = depths.clone().fold(None, |range: Option<(D, D)>, d| match range {
        None => Some((d, d)),
        Some((min, max)) => Some((if d < min { d } else { min }, if d > max { d } else { max })),
    }) else {
        return;
    };
    let (min, max) = (min.as_f64(), max.as_f64());
    if max <= min {
        out.fill(0);
        return;
    }
    let scale = (bin_count - 1) as f64 / (max - min);
    let top = (bin_count - 1) as f64;
    for (slot, d) in out.iter_mut().zip(depths) {
        *slot = ((d.as_f64() - min) * scale).floor().clamp(0.0, top) as u32;
    }
}

/// A culled group of splats with a representative position.
#[derive(Debug, Clone, Copy)]
pub struct SortLeaf<'a> {
    pub center: Vec3,
    pub indexes: &'a [u32],
}

/// Concatenate leaf index lists into `out`, farthest leaf first. Returns
/// the number of candidates gathered.
pub fn gather_indexes_for_sort(leaves: &[SortLeaf], camera_position: Vec3, out: &mut Vec<u32>) -> usize {
    let mut order: Vec<&SortLeaf> = leaves.iter().collect();
    order.sort_by_key(|leaf| std::cmp::Reverse(OrderedFloat(leaf.center.distance_squared(camera_position))));
    out.clear();
    for leaf in order {
        out.extend_from_slice(leaf.indexes);
    }
    out.len()
}
