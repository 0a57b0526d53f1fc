use glam::{Mat3, Mat4};
use smallvec::SmallVec;

use super::covariance::compute_covariance;
use super::sh_rotation::ShRotation;
use super::{transform_scale_rotation, ScaleOverride, SplatBuffer};
use crate::scalar::{CompressedScalar, RawScalar};
use crate::uncompressed::sh_count_for_degree;

/// Inclusive source range of global indices and the first destination slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillRange {
    pub src_from: usize,
    pub src_to: usize,
    pub dest_from: usize,
}

impl FillRange {
    pub fn new(src_from: usize, src_to: usize, dest_from: usize) -> Self {
        Self { src_from, src_to, dest_from }
    }

    /// Every published splat, written from slot 0. `None` when empty.
    pub fn all(buffer: &SplatBuffer) -> Option<Self> {
        let count = buffer.splat_count();
        (count > 0).then(|| Self::new(0, count - 1, 0))
    }

    pub fn len(&self) -> usize {
        self.src_to + 1 - self.src_from
    }

    pub fn is_empty(&self) -> bool {
        self.src_to < self.src_from
    }

    /// `(source index, destination slot)` pairs.
    fn iter(&self) -> impl Iterator<Item = (usize, usize)> {
        let offset = self.dest_from;
        let from = self.src_from;
        (self.src_from..=self.src_to).map(move |i| (i, i - from + offset))
    }
}

impl SplatBuffer {
    /// Centers as 3 components per splat.
    pub fn fill_splat_center_array<T: CompressedScalar>(
        &self,
        out: &mut [T],
        range: FillRange,
        transform: Option<&Mat4>,
    ) {
        for (src, dest) in range.iter() {
            let center = self.get_splat_center(src, transform);
            for (slot, v) in out[dest * 3..dest * 3 + 3].iter_mut().zip(center.to_array()) {
                *slot = T::from_f32(v, false, 0.0, 0.0);
            }
        }
    }

    /// Scales as 3 and rotations as 4 (`w, x, y, z`) components per splat.
    /// Either output may be skipped. Without a transform or override the
    /// stored values are re-encoded directly.
    pub fn fill_splat_scale_rotation_array<T: CompressedScalar>(
        &self,
        mut scales: Option<&mut [T]>,
        mut rotations: Option<&mut [T]>,
        range: FillRange,
        transform: Option<&Mat4>,
        scale_override: Option<ScaleOverride>,
    ) {
        let passthrough = transform.is_none() && scale_override.is_none();
        for (src, dest) in range.iter() {
            let (scale, rotation) = if passthrough {
                let splat = self.splat(src);
                (splat.raw_scale(), splat.raw_rotation())
            } else {
                let (scale, q) = self.get_splat_scale_and_rotation(src, transform, scale_override);
                (
                    scale.to_array().map(RawScalar::F32),
                    [q.w, q.x, q.y, q.z].map(RawScalar::F32),
                )
            };
            if let Some(out) = scales.as_deref_mut() {
                for (slot, raw) in out[dest * 3..dest * 3 + 3].iter_mut().zip(scale) {
                    *slot = T::from_raw(raw, false, 0.0, 0.0);
                }
            }
            if let Some(out) = rotations.as_deref_mut() {
                for (slot, raw) in out[dest * 4..dest * 4 + 4].iter_mut().zip(rotation) {
                    *slot = T::from_raw(raw, false, 0.0, 0.0);
                }
            }
        }
    }

    /// RGBA bytes. Splats below `minimum_alpha` get alpha 0.
    pub fn fill_splat_color_array(&self, out: &mut [u8], minimum_alpha: u8, range: FillRange) {
        for (src, dest) in range.iter() {
            let mut color = self.get_splat_color(src);
            if color[3] < minimum_alpha {
                color[3] = 0;
            }
            out[dest * 4..dest * 4 + 4].copy_from_slice(&color);
        }
    }

    /// Upper-triangle covariances, 6 components per splat.
    pub fn fill_splat_covariance_array<T: CompressedScalar>(
        &self,
        out: &mut [T],
        range: FillRange,
        transform: Option<&Mat4>,
    ) {
        let transform = transform.copied().map(Mat3::from_mat4);
        for (src, dest) in range.iter() {
            let splat = self.splat(src);
            compute_covariance(splat.scale(), splat.rotation(), transform.as_ref(), out, dest * 6);
        }
    }

    /// SH coefficients, `sh_count_for_degree(out_degree)` per splat. Missing
    /// higher bands are zero. A transform rotates the coefficients.
    pub fn fill_spherical_harmonics_array<T: CompressedScalar>(
        &self,
        out: &mut [T],
        out_degree: usize,
        range: FillRange,
        transform: Option<&Mat4>,
    ) {
        let stride = sh_count_for_degree(out_degree);
        if stride == 0 {
            return;
        }
        let (min, max) = self.sh_range();
        let rotation = transform.map(ShRotation::from_transform);

        for (src, dest) in range.iter() {
            let splat = self.splat(src);
            let count = sh_count_for_degree(splat.sh_degree()).min(stride);
            let out = &mut out[dest * stride..(dest + 1) * stride];
            match &rotation {
                None => {
                    for (i, slot) in out[..count].iter_mut().enumerate() {
                        *slot = T::from_raw(splat.raw_sh(i), true, min, max);
                    }
                }
                Some(rotation) => {
                    let mut sh: SmallVec<[f32; 24]> =
                        (0..count).map(|i| splat.raw_sh(i).to_f32(true, min, max)).collect();
                    rotation.apply(&mut sh);
                    for (slot, v) in out[..count].iter_mut().zip(sh) {
                        *slot = T::from_f32(v, true, min, max);
                    }
                }
            }
            out[count..].fill(T::default());
        }
    }
}
