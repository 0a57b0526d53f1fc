use glam::{Quat, Vec3};
use smallvec::{smallvec, SmallVec};

use crate::decoder::{SplatInit, SplatReceiver};

pub const X: usize = 0;
pub const Y: usize = 1;
pub const Z: usize = 2;
pub const SCALE0: usize = 3;
pub const ROTATION0: usize = 6;
pub const COLOR0: usize = 10;
pub const OPACITY: usize = 13;
pub const SH0: usize = 14;

pub const MAX_SH_DEGREE: usize = 2;
pub const BASE_COMPONENT_COUNT: usize = 14;
pub const MAX_COMPONENT_COUNT: usize = BASE_COMPONENT_COUNT + 24;

pub const fn sh_count_for_degree(degree: usize) -> usize {
    match degree {
        0 => 0,
        1 => 9,
        _ => 24,
    }
}

pub const fn component_count_for_degree(degree: usize) -> usize {
    BASE_COMPONENT_COUNT + sh_count_for_degree(degree)
}

/// One splat as a flat list of scalars:
/// `[x, y, z, scale0..2, rot0..3, r, g, b, opacity, sh...]`.
///
/// Rotation is stored scalar part first (`rot0 = w`). Color and opacity are
/// 0..255. SH coefficients are coefficient-major with RGB interleaved, so
/// coefficient `k` of channel `c` lives at `sh()[k * 3 + c]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SplatRecord {
    values: SmallVec<[f32; MAX_COMPONENT_COUNT]>,
}

impl SplatRecord {
    pub fn new(sh_degree: usize) -> Self {
        let mut values: SmallVec<[f32; MAX_COMPONENT_COUNT]> =
            smallvec![0.0; component_count_for_degree(sh_degree.min(MAX_SH_DEGREE))];
        values[ROTATION0] = 1.0;
        Self { values }
    }

    pub fn from_components(
        center: [f32; 3],
        scale: [f32; 3],
        rotation: [f32; 4],
        color: [f32; 3],
        opacity: f32,
        sh: &[f32],
    ) -> Self {
        let degree = match sh.len() {
            0 => 0,
            n if n <= sh_count_for_degree(1) => 1,
            _ => 2,
        };
        let mut record = Self::new(degree);
        record.values[X..X + 3].copy_from_slice(&center);
        record.values[SCALE0..SCALE0 + 3].copy_from_slice(&scale);
        record.values[ROTATION0..ROTATION0 + 4].copy_from_slice(&rotation);
        record.values[COLOR0..COLOR0 + 3].copy_from_slice(&color);
        record.values[OPACITY] = opacity;
        let count = sh.len().min(sh_count_for_degree(MAX_SH_DEGREE));
        record.values[SH0..SH0 + count].copy_from_slice(&sh[..count]);
        record
    }

    pub fn components(&self) -> &[f32] {
        &self.values
    }

    pub fn component_count(&self) -> usize {
        self.values.len()
    }

    pub fn sh_degree(&self) -> usize {
        match self.values.len() - BASE_COMPONENT_COUNT {
            0 => 0,
            n if n <= sh_count_for_degree(1) => 1,
            _ => 2,
        }
    }

    /// Resize the SH block to `degree`, zero-filling new coefficients.
    pub fn set_sh_degree(&mut self, degree: usize) {
        let degree = degree.min(MAX_SH_DEGREE);
        self.values.resize(component_count_for_degree(degree), 0.0);
    }

    pub fn center(&self) -> Vec3 {
        Vec3::new(self.values[X], self.values[Y], self.values[Z])
    }

    pub fn set_center(&mut self, center: Vec3) {
        self.values[X..X + 3].copy_from_slice(&center.to_array());
    }

    pub fn scale(&self) -> Vec3 {
        Vec3::from_slice(&self.values[SCALE0..SCALE0 + 3])
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.values[SCALE0..SCALE0 + 3].copy_from_slice(&scale.to_array());
    }

    /// Rotation as stored: `[w, x, y, z]`.
    pub fn rotation(&self) -> [f32; 4] {
        self.values[ROTATION0..ROTATION0 + 4].try_into().unwrap()
    }

    pub fn set_rotation(&mut self, rotation: [f32; 4]) {
        self.values[ROTATION0..ROTATION0 + 4].copy_from_slice(&rotation);
    }

    pub fn quaternion(&self) -> Quat {
        let [w, x, y, z] = self.rotation();
        Quat::from_xyzw(x, y, z, w)
    }

    pub fn set_quaternion(&mut self, quat: Quat) {
        self.set_rotation([quat.w, quat.x, quat.y, quat.z]);
    }

    pub fn color(&self) -> [f32; 3] {
        self.values[COLOR0..COLOR0 + 3].try_into().unwrap()
    }

    pub fn set_color(&mut self, color: [f32; 3]) {
        self.values[COLOR0..COLOR0 + 3].copy_from_slice(&color);
    }

    pub fn opacity(&self) -> f32 {
        self.values[OPACITY]
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.values[OPACITY] = opacity;
    }

    pub fn sh(&self) -> &[f32] {
        &self.values[SH0..]
    }

    pub fn sh_mut(&mut self) -> &mut [f32] {
        &mut self.values[SH0..]
    }
}

/// Normalize a `[w, x, y, z]` rotation. A zero-length rotation becomes identity.
pub fn normalize_rotation(rotation: [f32; 4]) -> [f32; 4] {
    let [w, x, y, z] = rotation;
    let length = (w * w + x * x + y * y + z * z).sqrt();
    if length <= 0.0 || !length.is_finite() {
        return [1.0, 0.0, 0.0, 0.0];
    }
    [w / length, x / length, y / length, z / length]
}

#[derive(Debug, Clone, Default)]
pub struct UncompressedSplatArray {
    sh_degree: usize,
    splats: Vec<SplatRecord>,
    base: usize,
}

impl UncompressedSplatArray {
    pub fn new(sh_degree: usize) -> Self {
        Self {
            sh_degree: sh_degree.min(MAX_SH_DEGREE),
            splats: Vec::new(),
            base: 0,
        }
    }

    pub fn with_capacity(sh_degree: usize, capacity: usize) -> Self {
        let mut array = Self::new(sh_degree);
        array.splats.reserve(capacity);
        array
    }

    pub fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub fn splat_count(&self) -> usize {
        self.splats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splats.is_empty()
    }

    /// Append a record, conforming its SH block to this array's degree.
    pub fn add_splat(&mut self, mut splat: SplatRecord) {
        splat.set_sh_degree(self.sh_degree);
        self.splats.push(splat);
    }

    pub fn add_default_splat(&mut self) -> &mut SplatRecord {
        self.splats.push(SplatRecord::new(self.sh_degree));
        let last = self.splats.len() - 1;
        &mut self.splats[last]
    }

    pub fn get(&self, index: usize) -> &SplatRecord {
        &self.splats[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut SplatRecord {
        &mut self.splats[index]
    }

    pub fn splats(&self) -> &[SplatRecord] {
        &self.splats
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplatRecord> {
        self.splats.iter()
    }

    pub fn retain(&mut self, f: impl FnMut(&SplatRecord) -> bool) {
        self.splats.retain(f);
    }
}

impl SplatReceiver for UncompressedSplatArray {
    fn init_splats(&mut self, init: &SplatInit) -> anyhow::Result<()> {
        self.base = self.splats.len();
        self.splats.resize(self.base + init.num_splats, SplatRecord::new(self.sh_degree));
        Ok(())
    }

    fn max_sh_degree(&self) -> usize {
        self.sh_degree
    }

    fn set_splat(&mut self, index: usize, mut splat: SplatRecord) -> anyhow::Result<()> {
        splat.set_sh_degree(self.sh_degree);
        let index = self.base + index;
        // Decoders that don't know the count up front append in order.
        if index == self.splats.len() {
            self.splats.push(splat);
            return Ok(());
        }
        let slot = self
            .splats
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("Splat index out of range: {}", index))?;
        *slot = splat;
        Ok(())
    }

    fn set_sh(&mut self, index: usize, sh: &[f32]) -> anyhow::Result<()> {
        let slot = self
            .splats
            .get_mut(self.base + index)
            .ok_or_else(|| anyhow::anyhow!("Splat index out of range: {}", index))?;
        let dest = slot.sh_mut();
        let count = dest.len().min(sh.len());
        dest[..count].copy_from_slice(&sh[..count]);
        Ok(())
    }
}
