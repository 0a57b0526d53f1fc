//! The `.ksplat` container: a header, fixed-size section headers, then one
//! storage block per section. Sections can be published one at a time while
//! readers already query the ones that are loaded.

mod covariance;
mod encode;
mod fill;
mod header;
mod ksplat_decoder;
mod progressive;
mod sh_rotation;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use anyhow::anyhow;
use glam::{Mat4, Quat, Vec3};
use half::f16;

pub use covariance::{compute_covariance, covariance_matrix};
pub use encode::{EncodeOptions, SectionOptions, SplatBufferGenerator};
pub use fill::FillRange;
pub use header::{
    bytes_per_splat, compression_layout, CompressionLayout, SectionHeader, SplatBufferHeader,
    BUCKET_STORAGE_SIZE_BYTES, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION, HEADER_SIZE_BYTES,
    PARTIAL_BUCKET_LENGTH_BYTES, SECTION_HEADER_SIZE_BYTES,
};
pub use ksplat_decoder::KSplatDecoder;
pub use progressive::{ProgressiveOptions, ProgressiveSplatBuffer};
pub use sh_rotation::ShRotation;

use crate::scalar::{CompressionLevel, RawScalar};
use crate::uncompressed::{normalize_rotation, SplatRecord, UncompressedSplatArray};

/// Per-axis replacement for decoded scales, `None` keeps the stored value.
pub type ScaleOverride = [Option<f32>; 3];

#[derive(Debug, Default)]
struct SectionData {
    /// Splat records only, bucket metadata is parsed out.
    records: Vec<u8>,
    bucket_centers: Vec<Vec3>,
    /// Exclusive end (local splat index) of each partial bucket.
    partial_bucket_ends: Vec<u32>,
}

static UNLOADED: SectionData = SectionData {
    records: Vec::new(),
    bucket_centers: Vec::new(),
    partial_bucket_ends: Vec::new(),
};

#[derive(Debug)]
pub struct Section {
    header: SectionHeader,
    /// Global index of this section's first splat.
    splat_count_offset: usize,
    bytes_per_splat: usize,
    loaded_splat_count: AtomicU32,
    data: OnceLock<SectionData>,
}

impl Section {
    pub fn header(&self) -> &SectionHeader {
        &self.header
    }

    pub fn splat_count_offset(&self) -> usize {
        self.splat_count_offset
    }

    pub fn max_splat_count(&self) -> usize {
        self.header.max_splat_count as usize
    }

    pub fn loaded_splat_count(&self) -> usize {
        self.loaded_splat_count.load(Ordering::Acquire) as usize
    }

    pub fn is_loaded(&self) -> bool {
        self.data.get().is_some()
    }

    fn data(&self) -> &SectionData {
        self.data.get().unwrap_or(&UNLOADED)
    }

    fn bucket_index(&self, data: &SectionData, local: usize) -> usize {
        let full_bucket_count = self.header.full_bucket_count as usize;
        let full_splats = full_bucket_count * self.header.bucket_size as usize;
        if local < full_splats {
            local / self.header.bucket_size as usize
        } else {
            let local = local as u32;
            full_bucket_count + data.partial_bucket_ends.partition_point(|end| *end <= local)
        }
    }
}

/// Borrowed view of one stored splat record.
pub struct SplatRef<'a> {
    section: &'a Section,
    data: &'a SectionData,
    local: usize,
    record: &'a [u8],
    level: CompressionLevel,
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

pub(crate) fn read_raw(bytes: &[u8], offset: usize, level: CompressionLevel) -> RawScalar {
    match level {
        CompressionLevel::Full => RawScalar::F32(read_f32(bytes, offset)),
        CompressionLevel::Half => RawScalar::F16(f16::from_bits(read_u16(bytes, offset))),
        CompressionLevel::Quantized => RawScalar::U8(bytes[offset]),
    }
}

impl SplatRef<'_> {
    /// Scale and rotation are never stored below half precision.
    fn transform_level(&self) -> CompressionLevel {
        self.level.min(CompressionLevel::Half)
    }

    pub fn center(&self) -> Vec3 {
        if self.level == CompressionLevel::Full {
            return Vec3::new(read_f32(self.record, 0), read_f32(self.record, 4), read_f32(self.record, 8));
        }
        let header = &self.section.header;
        let range = header.compression_scale_range as f32;
        let factor = header.compression_scale_factor();
        let bucket = self.section.bucket_index(self.data, self.local);
        let bucket_center = self.data.bucket_centers[bucket];
        let raw = Vec3::new(
            read_u16(self.record, 0) as f32,
            read_u16(self.record, 2) as f32,
            read_u16(self.record, 4) as f32,
        );
        (raw - Vec3::splat(range)) * factor + bucket_center
    }

    pub fn raw_scale(&self) -> [RawScalar; 3] {
        let layout = compression_layout(self.level);
        let level = self.transform_level();
        let step = layout.bytes_per_scale / 3;
        std::array::from_fn(|i| read_raw(self.record, layout.scale_offset + i * step, level))
    }

    /// Stored `[w, x, y, z]` components.
    pub fn raw_rotation(&self) -> [RawScalar; 4] {
        let layout = compression_layout(self.level);
        let level = self.transform_level();
        let step = layout.bytes_per_rotation / 4;
        std::array::from_fn(|i| read_raw(self.record, layout.rotation_offset + i * step, level))
    }

    pub fn scale(&self) -> Vec3 {
        Vec3::from_array(self.raw_scale().map(|v| v.to_f32(false, 0.0, 0.0)))
    }

    /// Normalized rotation with `w >= 0`.
    pub fn rotation(&self) -> Quat {
        let [w, x, y, z] = normalize_rotation(self.raw_rotation().map(|v| v.to_f32(false, 0.0, 0.0)));
        canonical(Quat::from_xyzw(x, y, z, w))
    }

    pub fn color(&self) -> [u8; 4] {
        let offset = compression_layout(self.level).color_offset;
        self.record[offset..offset + 4].try_into().unwrap()
    }

    pub fn sh_degree(&self) -> usize {
        self.section.header.sh_degree()
    }

    pub fn raw_sh(&self, index: usize) -> RawScalar {
        let layout = compression_layout(self.level);
        read_raw(self.record, layout.sh_offset + index * layout.bytes_per_sh_component, self.level)
    }
}

fn canonical(rotation: Quat) -> Quat {
    if rotation.w < 0.0 {
        -rotation
    } else {
        rotation
    }
}

/// Scale and rotation of `local` composed with `transform` and decomposed again.
pub(crate) fn transform_scale_rotation(scale: Vec3, rotation: Quat, transform: &Mat4) -> (Vec3, Quat) {
    let m = *transform * Mat4::from_scale_rotation_translation(scale, rotation, Vec3::ZERO);
    let (scale, rotation, _) = m.to_scale_rotation_translation();
    (scale, canonical(rotation.normalize()))
}

pub struct SplatBuffer {
    header: SplatBufferHeader,
    sections: Vec<Section>,
    loaded_section_count: AtomicU32,
    loaded_splat_count: AtomicU32,
    sh_degree: usize,
}

impl std::fmt::Debug for SplatBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplatBuffer")
            .field("header", &self.header)
            .field("section_count", &self.section_count())
            .field("splat_count", &self.splat_count())
            .finish()
    }
}

impl SplatBuffer {
    /// Empty container with every section allocated but unloaded.
    pub fn new(header: SplatBufferHeader, section_headers: Vec<SectionHeader>) -> anyhow::Result<Self> {
        if section_headers.len() != header.max_section_count as usize {
            return Err(anyhow!(
                "Expected {} section headers, got {}",
                header.max_section_count,
                section_headers.len()
            ));
        }
        let level = header.compression_level;
        let mut splat_count_offset = 0;
        let mut sections = Vec::with_capacity(section_headers.len());
        for section_header in section_headers {
            if (section_header.storage_size_bytes as usize) < section_header.computed_storage_size_bytes(level) {
                return Err(anyhow!(
                    "Section storage of {} bytes is smaller than its layout",
                    section_header.storage_size_bytes
                ));
            }
            if level != CompressionLevel::Full && section_header.bucket_size == 0 && section_header.full_bucket_count > 0 {
                return Err(anyhow!("Section has full buckets of size 0"));
            }
            let max_splat_count = section_header.max_splat_count as usize;
            sections.push(Section {
                bytes_per_splat: bytes_per_splat(level, section_header.sh_degree()),
                header: section_header,
                splat_count_offset,
                loaded_splat_count: AtomicU32::new(0),
                data: OnceLock::new(),
            });
            splat_count_offset += max_splat_count;
        }
        if splat_count_offset > header.max_splat_count as usize {
            return Err(anyhow!(
                "Sections hold {} splats, header allows {}",
                splat_count_offset,
                header.max_splat_count
            ));
        }

        let sh_degree = sections.iter().map(|s| s.header.sh_degree()).max().unwrap_or(0);
        Ok(Self {
            header,
            sections,
            loaded_section_count: AtomicU32::new(0),
            loaded_splat_count: AtomicU32::new(0),
            sh_degree,
        })
    }

    /// Parse a complete container. All section storage must be present.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let header = SplatBufferHeader::read(bytes)?;
        let level = header.compression_level;
        let section_count = header.max_section_count as usize;
        let data_start = HEADER_SIZE_BYTES + section_count * SECTION_HEADER_SIZE_BYTES;
        if bytes.len() < data_start {
            return Err(anyhow!("Splat buffer truncated in section headers"));
        }
        let section_headers = (0..section_count)
            .map(|i| {
                let start = HEADER_SIZE_BYTES + i * SECTION_HEADER_SIZE_BYTES;
                SectionHeader::read(&bytes[start..start + SECTION_HEADER_SIZE_BYTES], level)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let buffer = Self::new(header, section_headers)?;
        let mut offset = data_start;
        for index in 0..section_count {
            let storage = buffer.sections[index].header.storage_size_bytes as usize;
            let section_bytes = bytes
                .get(offset..offset + storage)
                .ok_or_else(|| anyhow!("Splat buffer truncated in section {}", index))?;
            buffer.load_section_bytes(index, section_bytes)?;
            let count = buffer.sections[index].header.splat_count as usize;
            buffer.update_section_loaded_count(index, count)?;
            offset += storage;
        }
        buffer.update_loaded_counts(buffer.header.section_count as usize, buffer.header.splat_count as usize);

        log::debug!(
            "Parsed splat buffer: level {}, {} sections, {} splats",
            level.as_u16(),
            buffer.section_count(),
            buffer.splat_count()
        );
        Ok(buffer)
    }

    /// Publish a section's storage block. Each section can be loaded once.
    pub fn load_section_bytes(&self, index: usize, bytes: &[u8]) -> anyhow::Result<()> {
        let section = self
            .sections
            .get(index)
            .ok_or_else(|| anyhow!("Section index out of range: {}", index))?;
        let header = &section.header;
        let level = self.header.compression_level;
        if bytes.len() < header.computed_storage_size_bytes(level) {
            return Err(anyhow!("Section {} storage truncated: {} bytes", index, bytes.len()));
        }

        let mut data = SectionData::default();
        let mut offset = 0;
        if level != CompressionLevel::Full {
            let mut end = header.full_bucket_count * header.bucket_size;
            for _ in 0..header.partially_filled_bucket_count {
                end += u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
                data.partial_bucket_ends.push(end);
                offset += PARTIAL_BUCKET_LENGTH_BYTES;
            }
            for _ in 0..header.bucket_count {
                data.bucket_centers.push(Vec3::new(
                    read_f32(bytes, offset),
                    read_f32(bytes, offset + 4),
                    read_f32(bytes, offset + 8),
                ));
                offset += header.bucket_storage_size_bytes as usize;
            }
        }
        let records_len = header.splat_data_size_bytes(level);
        data.records = bytes[offset..offset + records_len].to_vec();

        section
            .data
            .set(data)
            .map_err(|_| anyhow!("Section {} is already loaded", index))
    }

    /// Raise the published section and splat counts. Counts never decrease
    /// and are clamped to the header maxima.
    pub fn update_loaded_counts(&self, section_count: usize, splat_count: usize) {
        let section_count = section_count.min(self.header.max_section_count as usize) as u32;
        let splat_count = splat_count.min(self.header.max_splat_count as usize) as u32;
        self.loaded_section_count.fetch_max(section_count, Ordering::Release);
        self.loaded_splat_count.fetch_max(splat_count, Ordering::Release);
    }

    pub fn update_section_loaded_count(&self, index: usize, count: usize) -> anyhow::Result<()> {
        let section = self
            .sections
            .get(index)
            .ok_or_else(|| anyhow!("Section index out of range: {}", index))?;
        let count = count.min(section.max_splat_count()) as u32;
        section.loaded_splat_count.fetch_max(count, Ordering::Release);
        Ok(())
    }

    pub fn header(&self) -> &SplatBufferHeader {
        &self.header
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> &Section {
        &self.sections[index]
    }

    pub fn compression_level(&self) -> CompressionLevel {
        self.header.compression_level
    }

    pub fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub fn scene_center(&self) -> Vec3 {
        Vec3::from_array(self.header.scene_center)
    }

    pub fn sh_range(&self) -> (f32, f32) {
        (self.header.min_sh_coeff, self.header.max_sh_coeff)
    }

    /// Published splat count. Indices below it are fully readable.
    pub fn splat_count(&self) -> usize {
        self.loaded_splat_count.load(Ordering::Acquire) as usize
    }

    pub fn max_splat_count(&self) -> usize {
        self.header.max_splat_count as usize
    }

    pub fn section_count(&self) -> usize {
        self.loaded_section_count.load(Ordering::Acquire) as usize
    }

    pub fn max_section_count(&self) -> usize {
        self.header.max_section_count as usize
    }

    /// Map a global splat index to `(section, local index)`.
    pub fn locate(&self, index: usize) -> (usize, usize) {
        let section = self
            .sections
            .partition_point(|s| s.splat_count_offset + s.max_splat_count() <= index);
        (section, index - self.sections[section].splat_count_offset)
    }

    /// Record view for a global index. Panics when the index is outside
    /// every section or its section is not loaded yet.
    pub fn splat(&self, index: usize) -> SplatRef<'_> {
        let (section_index, local) = self.locate(index);
        let section = &self.sections[section_index];
        let data = section.data();
        let start = local * section.bytes_per_splat;
        SplatRef {
            section,
            data,
            local,
            record: &data.records[start..start + section.bytes_per_splat],
            level: self.header.compression_level,
        }
    }

    pub fn get_splat_center(&self, index: usize, transform: Option<&Mat4>) -> Vec3 {
        let center = self.splat(index).center();
        match transform {
            Some(t) => t.transform_point3(center),
            None => center,
        }
    }

    pub fn get_splat_scale_and_rotation(
        &self,
        index: usize,
        transform: Option<&Mat4>,
        scale_override: Option<ScaleOverride>,
    ) -> (Vec3, Quat) {
        let splat = self.splat(index);
        let mut scale = splat.scale();
        if let Some(scale_override) = scale_override {
            for (axis, value) in scale_override.iter().enumerate() {
                if let Some(value) = value {
                    scale[axis] = *value;
                }
            }
        }
        let rotation = splat.rotation();
        match transform {
            Some(t) => transform_scale_rotation(scale, rotation, t),
            None => (scale, rotation),
        }
    }

    pub fn get_splat_color(&self, index: usize) -> [u8; 4] {
        self.splat(index).color()
    }

    /// Decode a whole record at full precision, SH at the section's degree.
    pub fn get_splat_record(&self, index: usize) -> SplatRecord {
        let splat = self.splat(index);
        let (min, max) = self.sh_range();
        let mut record = SplatRecord::new(splat.sh_degree());
        record.set_center(splat.center());
        record.set_scale(splat.scale());
        record.set_quaternion(splat.rotation());
        let [r, g, b, a] = splat.color();
        record.set_color([r as f32, g as f32, b as f32]);
        record.set_opacity(a as f32);
        for (i, dest) in record.sh_mut().iter_mut().enumerate() {
            *dest = splat.raw_sh(i).to_f32(true, min, max);
        }
        record
    }

    /// Decode every loaded section back into full-precision arrays, one per
    /// section, for re-encoding.
    pub fn to_uncompressed_arrays(&self) -> Vec<UncompressedSplatArray> {
        self.sections
            .iter()
            .filter(|section| section.is_loaded())
            .map(|section| {
                let count = section.loaded_splat_count();
                let mut array = UncompressedSplatArray::with_capacity(section.header.sh_degree(), count);
                let start = section.splat_count_offset;
                for index in start..start + count {
                    array.add_splat(self.get_splat_record(index));
                }
                array
            })
            .collect()
    }

    /// Serialize with the currently published counts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let level = self.header.compression_level;
        let data_start = HEADER_SIZE_BYTES + self.sections.len() * SECTION_HEADER_SIZE_BYTES;
        let total = data_start
            + self
                .sections
                .iter()
                .map(|s| s.header.storage_size_bytes as usize)
                .sum::<usize>();
        let mut out = vec![0u8; total];

        let header = SplatBufferHeader {
            section_count: self.section_count() as u32,
            splat_count: self.splat_count() as u32,
            ..self.header.clone()
        };
        header.write(&mut out);

        let mut offset = data_start;
        for (index, section) in self.sections.iter().enumerate() {
            let section_header = SectionHeader {
                splat_count: section.loaded_splat_count() as u32,
                ..section.header.clone()
            };
            let start = HEADER_SIZE_BYTES + index * SECTION_HEADER_SIZE_BYTES;
            section_header.write(&mut out[start..start + SECTION_HEADER_SIZE_BYTES]);

            if let Some(data) = section.data.get() {
                let mut cursor = offset;
                if level != CompressionLevel::Full {
                    let mut previous = section.header.full_bucket_count * section.header.bucket_size;
                    for end in &data.partial_bucket_ends {
                        out[cursor..cursor + 4].copy_from_slice(&(end - previous).to_le_bytes());
                        previous = *end;
                        cursor += PARTIAL_BUCKET_LENGTH_BYTES;
                    }
                    for center in &data.bucket_centers {
                        for (i, v) in center.to_array().iter().enumerate() {
                            out[cursor + i * 4..cursor + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
                        }
                        cursor += section.header.bucket_storage_size_bytes as usize;
                    }
                }
                out[cursor..cursor + data.records.len()].copy_from_slice(&data.records);
            }
            offset += section.header.storage_size_bytes as usize;
        }
        out
    }
}
