use glam::Vec3;
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

use super::header::{
    bytes_per_splat, compression_layout, SectionHeader, SplatBufferHeader, BUCKET_STORAGE_SIZE_BYTES,
    HEADER_SIZE_BYTES, PARTIAL_BUCKET_LENGTH_BYTES, SECTION_HEADER_SIZE_BYTES,
};
use super::SplatBuffer;
use crate::bucket::compute_buckets;
use crate::scalar::{CompressionLevel, RawScalar, DEFAULT_8BIT_HALF_RANGE};
use crate::uncompressed::{normalize_rotation, sh_count_for_degree, SplatRecord, UncompressedSplatArray};

pub const DEFAULT_BLOCK_SIZE: f32 = 5.0;
pub const DEFAULT_BUCKET_SIZE: u32 = 256;

/// Per-section multipliers on the global block and bucket sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SectionOptions {
    pub block_size_factor: f32,
    pub bucket_size_factor: f32,
}

impl Default for SectionOptions {
    fn default() -> Self {
        Self { block_size_factor: 1.0, bucket_size_factor: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncodeOptions {
    /// Splats with opacity (0..255) below this are dropped.
    pub minimum_alpha: f32,
    pub compression_level: CompressionLevel,
    pub scene_center: [f32; 3],
    pub block_size: f32,
    pub bucket_size: u32,
    /// Indexed by section. Missing entries use the defaults.
    pub sections: Vec<SectionOptions>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            minimum_alpha: 1.0,
            compression_level: CompressionLevel::Full,
            scene_center: [0.0; 3],
            block_size: DEFAULT_BLOCK_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            sections: Vec::new(),
        }
    }
}

fn write_raw(out: &mut [u8], offset: usize, raw: RawScalar) -> usize {
    match raw {
        RawScalar::F32(v) => {
            out[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            4
        }
        RawScalar::F16(v) => {
            out[offset..offset + 2].copy_from_slice(&v.to_bits().to_le_bytes());
            2
        }
        RawScalar::U8(v) => {
            out[offset] = v;
            1
        }
    }
}

/// Writes single records for one section's layout.
pub(crate) struct RecordEncoder {
    level: CompressionLevel,
    sh_degree: usize,
    sh_count: usize,
    sh_range: (f32, f32),
    half_block_size: f32,
    scale_range: u32,
}

impl RecordEncoder {
    pub(crate) fn new(level: CompressionLevel, sh_degree: usize, sh_range: (f32, f32), block_size: f32) -> Self {
        Self {
            level,
            sh_degree,
            sh_count: sh_count_for_degree(sh_degree),
            sh_range,
            half_block_size: block_size / 2.0,
            scale_range: compression_layout(level).scale_range,
        }
    }

    pub(crate) fn bytes_per_splat(&self) -> usize {
        bytes_per_splat(self.level, self.sh_degree)
    }

    fn quantize_center(&self, value: f32, bucket_center: f32) -> u16 {
        let range = self.scale_range as f32;
        let q = ((value - bucket_center) * range / self.half_block_size).round() + range;
        q.clamp(0.0, 2.0 * range + 1.0) as u16
    }

    /// Encode `splat` into `out`, which must be one record long.
    pub(crate) fn write(&self, out: &mut [u8], splat: &SplatRecord, bucket_center: Vec3) {
        let layout = compression_layout(self.level);
        let center = splat.center();
        if self.level == CompressionLevel::Full {
            for (i, v) in center.to_array().iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        } else {
            for (i, (v, c)) in center.to_array().iter().zip(bucket_center.to_array()).enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&self.quantize_center(*v, c).to_le_bytes());
            }
        }

        let field_level = self.level.min(CompressionLevel::Half);
        let mut offset = layout.scale_offset;
        for v in splat.scale().to_array() {
            offset += write_raw(out, offset, RawScalar::from_f32(v, field_level, false, 0.0, 0.0));
        }
        let mut offset = layout.rotation_offset;
        for v in normalize_rotation(splat.rotation()) {
            offset += write_raw(out, offset, RawScalar::from_f32(v, field_level, false, 0.0, 0.0));
        }

        let [r, g, b] = splat.color();
        let color = [r, g, b, splat.opacity()].map(|v| v.round().clamp(0.0, 255.0) as u8);
        out[layout.color_offset..layout.color_offset + 4].copy_from_slice(&color);

        let (min, max) = self.sh_range;
        let mut offset = layout.sh_offset;
        let sh = splat.sh();
        for i in 0..self.sh_count {
            let v = sh.get(i).copied().unwrap_or(0.0);
            offset += write_raw(out, offset, RawScalar::from_f32(v, self.level, true, min, max));
        }
    }
}

/// Shared SH quantization range over every section.
fn sh_range(arrays: &[UncompressedSplatArray]) -> (f32, f32) {
    let values = arrays
        .iter()
        .flat_map(|a| a.iter())
        .flat_map(|s| s.sh().iter().copied())
        .filter(|v| v.is_finite());
    let (min, max) = match values.minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements => return (-DEFAULT_8BIT_HALF_RANGE, DEFAULT_8BIT_HALF_RANGE),
        MinMaxResult::OneElement(v) => (v.min(-DEFAULT_8BIT_HALF_RANGE), v.max(DEFAULT_8BIT_HALF_RANGE)),
        MinMaxResult::MinMax(min, max) if min < max => (min, max),
        MinMaxResult::MinMax(v, _) => (v.min(-DEFAULT_8BIT_HALF_RANGE), v.max(DEFAULT_8BIT_HALF_RANGE)),
    };
    // A stored zero reads back as the default range.
    let nudge = |v: f32, toward: f32| if v == 0.0 { toward } else { v };
    (nudge(min, -f32::EPSILON), nudge(max, f32::EPSILON))
}

/// Builds `.ksplat` containers from uncompressed sections.
pub struct SplatBufferGenerator {
    options: EncodeOptions,
}

impl SplatBufferGenerator {
    pub fn new(options: EncodeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    pub fn generate(&self, arrays: &[UncompressedSplatArray]) -> anyhow::Result<SplatBuffer> {
        SplatBuffer::from_bytes(&self.generate_bytes(arrays)?)
    }

    pub fn generate_bytes(&self, arrays: &[UncompressedSplatArray]) -> anyhow::Result<Vec<u8>> {
        let options = &self.options;
        let level = options.compression_level;
        if options.block_size.is_nan() || options.block_size <= 0.0 {
            return Err(anyhow::anyhow!("Invalid block size: {}", options.block_size));
        }

        let filtered: Vec<UncompressedSplatArray> = arrays
            .iter()
            .map(|array| {
                let mut array = array.clone();
                array.retain(|s| s.opacity() >= options.minimum_alpha);
                array
            })
            .collect();
        let sh_degree = arrays.iter().map(|a| a.sh_degree()).max().unwrap_or(0);
        let sh_range = sh_range(&filtered);

        let mut section_headers = Vec::with_capacity(filtered.len());
        let mut section_data = Vec::with_capacity(filtered.len());
        for (index, array) in filtered.iter().enumerate() {
            let section_options = options.sections.get(index).copied().unwrap_or_default();
            let block_size = options.block_size * section_options.block_size_factor;
            let bucket_size = ((options.bucket_size as f32 * section_options.bucket_size_factor).round() as u32).max(1);
            let (header, data) = encode_section(array, level, sh_degree, sh_range, block_size, bucket_size);
            section_headers.push(header);
            section_data.push(data);
        }

        let splat_count: u32 = section_headers.iter().map(|h| h.splat_count).sum();
        let header = SplatBufferHeader {
            max_section_count: section_headers.len() as u32,
            section_count: section_headers.len() as u32,
            max_splat_count: splat_count,
            splat_count,
            compression_level: level,
            scene_center: options.scene_center,
            min_sh_coeff: sh_range.0,
            max_sh_coeff: sh_range.1,
            ..Default::default()
        };

        let total = HEADER_SIZE_BYTES
            + section_headers.len() * SECTION_HEADER_SIZE_BYTES
            + section_data.iter().map(Vec::len).sum::<usize>();
        let mut out = vec![0u8; HEADER_SIZE_BYTES + section_headers.len() * SECTION_HEADER_SIZE_BYTES];
        out.reserve(total - out.len());
        header.write(&mut out);
        for (index, section_header) in section_headers.iter().enumerate() {
            let start = HEADER_SIZE_BYTES + index * SECTION_HEADER_SIZE_BYTES;
            section_header.write(&mut out[start..start + SECTION_HEADER_SIZE_BYTES]);
        }
        for data in section_data {
            out.extend_from_slice(&data);
        }

        log::info!(
            "Encoded {} of {} splats in {} sections at level {}",
            splat_count,
            arrays.iter().map(|a| a.splat_count()).sum::<usize>(),
            section_headers.len(),
            level.as_u16()
        );
        Ok(out)
    }
}

fn encode_section(
    array: &UncompressedSplatArray,
    level: CompressionLevel,
    sh_degree: usize,
    sh_range: (f32, f32),
    block_size: f32,
    bucket_size: u32,
) -> (SectionHeader, Vec<u8>) {
    let encoder = RecordEncoder::new(level, sh_degree, sh_range, block_size);
    let record_size = encoder.bytes_per_splat();
    let splat_count = array.splat_count() as u32;

    if level == CompressionLevel::Full {
        let mut data = vec![0u8; record_size * array.splat_count()];
        for (splat, out) in array.iter().zip(data.chunks_exact_mut(record_size)) {
            encoder.write(out, splat, Vec3::ZERO);
        }
        let header = SectionHeader {
            splat_count,
            max_splat_count: splat_count,
            bucket_size: 0,
            bucket_count: 0,
            bucket_block_size: 0.0,
            bucket_storage_size_bytes: 0,
            compression_scale_range: compression_layout(level).scale_range,
            storage_size_bytes: data.len() as u32,
            full_bucket_count: 0,
            partially_filled_bucket_count: 0,
            sh_degree: sh_degree as u16,
        };
        return (header, data);
    }

    let buckets = compute_buckets(array, block_size, bucket_size as usize);
    let metadata_size = buckets.partial.len() * PARTIAL_BUCKET_LENGTH_BYTES
        + buckets.bucket_count() * BUCKET_STORAGE_SIZE_BYTES as usize;
    let mut data = vec![0u8; metadata_size + record_size * array.splat_count()];

    let mut offset = 0;
    for bucket in &buckets.partial {
        data[offset..offset + 4].copy_from_slice(&(bucket.splats.len() as u32).to_le_bytes());
        offset += PARTIAL_BUCKET_LENGTH_BYTES;
    }
    for bucket in buckets.iter() {
        for v in bucket.center.to_array() {
            data[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            offset += 4;
        }
    }
    let mut records = data[offset..].chunks_exact_mut(record_size);
    for bucket in buckets.iter() {
        for &index in &bucket.splats {
            if let Some(out) = records.next() {
                encoder.write(out, array.get(index as usize), bucket.center);
            }
        }
    }

    let header = SectionHeader {
        splat_count,
        max_splat_count: splat_count,
        bucket_size,
        bucket_count: buckets.bucket_count() as u32,
        bucket_block_size: block_size,
        bucket_storage_size_bytes: BUCKET_STORAGE_SIZE_BYTES,
        compression_scale_range: compression_layout(level).scale_range,
        storage_size_bytes: data.len() as u32,
        full_bucket_count: buckets.full.len() as u32,
        partially_filled_bucket_count: buckets.partial.len() as u32,
        sh_degree: sh_degree as u16,
    };
    (header, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splat(center: [f32; 3], opacity: f32, sh: &[f32]) -> SplatRecord {
        SplatRecord::from_components(center, [0.1, 0.2, 0.3], [0.0, 0.0, 0.0, 2.0], [1.0, 2.0, 3.0], opacity, sh)
    }

    #[test]
    fn test_alpha_filter_and_empty_section() {
        let mut array = UncompressedSplatArray::new(0);
        array.add_splat(splat([0.0; 3], 0.0, &[]));
        array.add_splat(splat([1.0; 3], 200.0, &[]));
        let options = EncodeOptions { minimum_alpha: 1.0, ..Default::default() };
        let buffer = SplatBufferGenerator::new(options.clone()).generate(&[array.clone()]).unwrap();
        assert_eq!(buffer.splat_count(), 1);
        assert_eq!(buffer.get_splat_center(0, None).to_array(), [1.0; 3]);
        // normalized on write
        assert_eq!(buffer.splat(0).raw_rotation()[3], RawScalar::F32(1.0));

        let mut transparent = UncompressedSplatArray::new(0);
        transparent.add_splat(splat([0.0; 3], 0.0, &[]));
        let buffer = SplatBufferGenerator::new(options).generate(&[transparent]).unwrap();
        assert_eq!(buffer.max_section_count(), 1);
        assert_eq!(buffer.splat_count(), 0);
        assert_eq!(buffer.section(0).header().splat_count, 0);
    }

    #[test]
    fn test_full_buckets_written_first() {
        let mut array = UncompressedSplatArray::new(0);
        // Two splats far away, then three in the first cell.
        array.add_splat(splat([100.0, 0.0, 0.0], 255.0, &[]));
        for i in 0..3 {
            array.add_splat(splat([i as f32 * 0.1, 0.0, 0.0], 255.0, &[]));
        }
        let options = EncodeOptions {
            compression_level: CompressionLevel::Half,
            bucket_size: 2,
            ..Default::default()
        };
        let buffer = SplatBufferGenerator::new(options).generate(&[array]).unwrap();
        let section = buffer.section(0).header();
        assert_eq!(section.full_bucket_count, 1);
        assert_eq!(section.partially_filled_bucket_count, 2);
        assert_eq!(section.bucket_count, 3);
        let first = buffer.get_splat_center(0, None);
        assert!((first.x - 0.0).abs() < 1e-3);
        let second = buffer.get_splat_center(1, None);
        assert!((second.x - 0.1).abs() < 1e-3);
        // partial buckets sorted by cell: (0,0,0) before (20,0,0)
        assert!((buffer.get_splat_center(2, None).x - 0.2).abs() < 1e-3);
        assert!((buffer.get_splat_center(3, None).x - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_sh_range_is_global() {
        let mut a = UncompressedSplatArray::new(1);
        a.add_splat(splat([0.0; 3], 255.0, &[-0.5; 9]));
        let mut b = UncompressedSplatArray::new(1);
        b.add_splat(splat([0.0; 3], 255.0, &[2.0; 9]));
        let options = EncodeOptions { compression_level: CompressionLevel::Quantized, ..Default::default() };
        let buffer = SplatBufferGenerator::new(options).generate(&[a, b]).unwrap();
        assert_eq!(buffer.sh_range(), (-0.5, 2.0));
        assert_eq!(buffer.splat(0).raw_sh(0), RawScalar::U8(0));
        assert_eq!(buffer.splat(1).raw_sh(8), RawScalar::U8(255));
        let record = buffer.get_splat_record(1);
        assert!((record.sh()[4] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_sh_range_defaults() {
        assert_eq!(sh_range(&[UncompressedSplatArray::new(0)]), (-1.5, 1.5));
        let mut array = UncompressedSplatArray::new(1);
        array.add_splat(splat([0.0; 3], 255.0, &[0.0, 0.5, 1.0]));
        assert_eq!(sh_range(&[array]), (-f32::EPSILON, 1.0));
    }

    #[test]
    fn test_sh_range_skips_non_finite() {
        let mut array = UncompressedSplatArray::new(1);
        array.add_splat(splat([0.0; 3], 255.0, &[f32::NAN, -0.5, 2.5, f32::INFINITY]));
        assert_eq!(sh_range(&[array]), (-0.5, 2.5));
    }

    #[test]
    fn test_record_sizes_follow_layout_table() {
        let sizes = |level| {
            (0..3)
                .map(|degree| RecordEncoder::new(level, degree, (-1.5, 1.5), 5.0).bytes_per_splat())
                .collect::<Vec<_>>()
        };
        assert_eq!(sizes(CompressionLevel::Full), vec![44, 80, 140]);
        assert_eq!(sizes(CompressionLevel::Half), vec![24, 42, 72]);
        assert_eq!(sizes(CompressionLevel::Quantized), vec![24, 33, 48]);
    }

    #[test]
    fn test_section_factors() {
        let options = EncodeOptions {
            compression_level: CompressionLevel::Half,
            sections: vec![SectionOptions { block_size_factor: 2.0, bucket_size_factor: 0.5 }],
            ..Default::default()
        };
        let mut array = UncompressedSplatArray::new(0);
        array.add_splat(splat([0.0; 3], 255.0, &[]));
        let buffer = SplatBufferGenerator::new(options)
            .generate(&[array.clone(), array])
            .unwrap();
        assert_eq!(buffer.section(0).header().bucket_block_size, 10.0);
        assert_eq!(buffer.section(0).header().bucket_size, 128);
        assert_eq!(buffer.section(1).header().bucket_block_size, 5.0);
        assert_eq!(buffer.section(1).header().bucket_size, 256);
    }

    #[test]
    fn test_options_from_json() {
        let options: EncodeOptions =
            serde_json::from_str(r#"{"compressionLevel": 2, "minimumAlpha": 5, "sections": [{"blockSizeFactor": 2}]}"#)
                .unwrap();
        assert_eq!(options.compression_level, CompressionLevel::Quantized);
        assert_eq!(options.block_size, 5.0);
        assert_eq!(options.sections[0].bucket_size_factor, 1.0);
        assert!(serde_json::from_str::<EncodeOptions>(r#"{"compressionLevel": 4}"#).is_err());
    }
}
