use std::sync::Arc;

use anyhow::anyhow;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::encode::RecordEncoder;
use super::header::{compression_layout, SectionHeader, SplatBufferHeader};
use super::SplatBuffer;
use crate::decoder::{SplatInit, SplatReceiver};
use crate::scalar::{CompressionLevel, DEFAULT_8BIT_HALF_RANGE};
use crate::uncompressed::{SplatRecord, MAX_SH_DEGREE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressiveOptions {
    /// Splats per published section.
    pub section_size: usize,
    pub max_sh_degree: usize,
}

impl Default for ProgressiveOptions {
    fn default() -> Self {
        Self { section_size: 65536, max_sh_degree: MAX_SH_DEGREE }
    }
}

struct Staged {
    bytes: Vec<u8>,
    /// One flag per slot; a repeated write overwrites without counting twice.
    written: Vec<bool>,
    filled: usize,
}

/// Receives decoded splats and publishes them into a full-precision
/// `SplatBuffer` one section at a time. Readers hold the `Arc` returned by
/// [`buffer`](Self::buffer) and see sections as they complete.
pub struct ProgressiveSplatBuffer {
    options: ProgressiveOptions,
    buffer: Option<Arc<SplatBuffer>>,
    encoder: Option<RecordEncoder>,
    sh_degree: usize,
    deferred_sh: bool,
    staging: Vec<Option<Staged>>,
    published: Vec<bool>,
    published_prefix: usize,
    published_splats: usize,
    /// Splats received before the total count is known.
    pending: Vec<SplatRecord>,
}

impl ProgressiveSplatBuffer {
    pub fn new(options: ProgressiveOptions) -> Self {
        let sh_degree = options.max_sh_degree.min(MAX_SH_DEGREE);
        Self {
            options: ProgressiveOptions { section_size: options.section_size.max(1), ..options },
            buffer: None,
            encoder: None,
            sh_degree,
            deferred_sh: false,
            staging: Vec::new(),
            published: Vec::new(),
            published_prefix: 0,
            published_splats: 0,
            pending: Vec::new(),
        }
    }

    /// Shared container, available once the splat count is known.
    pub fn buffer(&self) -> Option<Arc<SplatBuffer>> {
        self.buffer.clone()
    }

    pub fn into_buffer(self) -> anyhow::Result<Arc<SplatBuffer>> {
        self.buffer.ok_or_else(|| anyhow!("No splats were received"))
    }

    fn allocate(&mut self, num_splats: usize) -> anyhow::Result<()> {
        let level = CompressionLevel::Full;
        let section_size = self.options.section_size;
        let sh_range = (-DEFAULT_8BIT_HALF_RANGE, DEFAULT_8BIT_HALF_RANGE);
        let encoder = RecordEncoder::new(level, self.sh_degree, sh_range, 1.0);
        let record_size = encoder.bytes_per_splat();

        let section_headers: Vec<SectionHeader> = (0..num_splats.div_ceil(section_size))
            .map(|i| {
                let count = section_size.min(num_splats - i * section_size) as u32;
                SectionHeader {
                    splat_count: count,
                    max_splat_count: count,
                    bucket_size: 0,
                    bucket_count: 0,
                    bucket_block_size: 0.0,
                    bucket_storage_size_bytes: 0,
                    compression_scale_range: compression_layout(level).scale_range,
                    storage_size_bytes: count * record_size as u32,
                    full_bucket_count: 0,
                    partially_filled_bucket_count: 0,
                    sh_degree: self.sh_degree as u16,
                }
            })
            .collect();
        let header = SplatBufferHeader {
            max_section_count: section_headers.len() as u32,
            section_count: section_headers.len() as u32,
            max_splat_count: num_splats as u32,
            splat_count: num_splats as u32,
            compression_level: level,
            min_sh_coeff: sh_range.0,
            max_sh_coeff: sh_range.1,
            ..Default::default()
        };

        self.staging = section_headers.iter().map(|_| None).collect();
        self.published = vec![false; section_headers.len()];
        self.buffer = Some(Arc::new(SplatBuffer::new(header, section_headers)?));
        self.encoder = Some(encoder);
        log::debug!("Allocated progressive splat buffer for {} splats", num_splats);
        Ok(())
    }

    fn staged(&mut self, index: usize) -> anyhow::Result<(&mut Staged, usize, &RecordEncoder)> {
        let (Some(buffer), Some(encoder)) = (self.buffer.as_ref(), self.encoder.as_ref()) else {
            return Err(anyhow!("Splat buffer not allocated"));
        };
        if index >= buffer.max_splat_count() {
            return Err(anyhow!("Splat index out of range: {}", index));
        }
        let section = index / self.options.section_size;
        if self.published[section] {
            return Err(anyhow!("Section {} was already published", section));
        }
        let record_size = encoder.bytes_per_splat();
        let slots = buffer.section(section).max_splat_count();
        let staged = self.staging[section].get_or_insert_with(|| Staged {
            bytes: vec![0; slots * record_size],
            written: vec![false; slots],
            filled: 0,
        });
        Ok((staged, index % self.options.section_size, encoder))
    }

    fn publish(&mut self, section: usize) -> anyhow::Result<()> {
        let Some(buffer) = self.buffer.as_ref() else {
            return Err(anyhow!("Splat buffer not allocated"));
        };
        let bytes = self.staging[section].take().map(|s| s.bytes).unwrap_or_default();
        let count = buffer.section(section).max_splat_count();
        if bytes.is_empty() && count > 0 {
            return Err(anyhow!("Section {} received no splats", section));
        }
        buffer.load_section_bytes(section, &bytes)?;
        buffer.update_section_loaded_count(section, count)?;
        self.published[section] = true;

        while self.published_prefix < self.published.len() && self.published[self.published_prefix] {
            self.published_splats += buffer.section(self.published_prefix).max_splat_count();
            self.published_prefix += 1;
        }
        buffer.update_loaded_counts(self.published_prefix, self.published_splats);
        log::debug!("Published section {} ({} splats loaded)", section, self.published_splats);
        Ok(())
    }

    fn write_splat(&mut self, index: usize, splat: &SplatRecord) -> anyhow::Result<()> {
        let (staged, slot, encoder) = self.staged(index)?;
        let start = slot * encoder.bytes_per_splat();
        let end = start + encoder.bytes_per_splat();
        encoder.write(&mut staged.bytes[start..end], splat, Vec3::ZERO);
        if !std::mem::replace(&mut staged.written[slot], true) {
            staged.filled += 1;
        }
        let full = staged.filled == staged.written.len();
        if full && !self.deferred_sh {
            self.publish(index / self.options.section_size)?;
        }
        Ok(())
    }
}

impl SplatReceiver for ProgressiveSplatBuffer {
    fn init_splats(&mut self, init: &SplatInit) -> anyhow::Result<()> {
        if self.buffer.is_some() || !self.pending.is_empty() {
            return Err(anyhow!("Progressive splat buffer already initialized"));
        }
        self.sh_degree = self.sh_degree.min(init.sh_degree);
        self.deferred_sh = init.deferred_sh && self.sh_degree > 0;
        if init.num_splats > 0 {
            self.allocate(init.num_splats)?;
        }
        Ok(())
    }

    fn max_sh_degree(&self) -> usize {
        self.sh_degree
    }

    fn set_splat(&mut self, index: usize, splat: SplatRecord) -> anyhow::Result<()> {
        if self.buffer.is_none() {
            if index != self.pending.len() {
                return Err(anyhow!("Splat {} arrived out of order", index));
            }
            self.pending.push(splat);
            return Ok(());
        }
        self.write_splat(index, &splat)
    }

    fn set_sh(&mut self, index: usize, sh: &[f32]) -> anyhow::Result<()> {
        if self.buffer.is_none() {
            let splat = self
                .pending
                .get_mut(index)
                .ok_or_else(|| anyhow!("Splat index out of range: {}", index))?;
            let dest = splat.sh_mut();
            let count = dest.len().min(sh.len());
            dest[..count].copy_from_slice(&sh[..count]);
            return Ok(());
        }
        let (staged, slot, encoder) = self.staged(index)?;
        let start = slot * encoder.bytes_per_splat();
        let layout = compression_layout(CompressionLevel::Full);
        let count = (encoder.bytes_per_splat() - layout.sh_offset) / 4;
        for (i, v) in sh.iter().take(count).enumerate() {
            let offset = start + layout.sh_offset + i * 4;
            staged.bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.buffer.is_none() {
            let pending = std::mem::take(&mut self.pending);
            self.allocate(pending.len())?;
            self.deferred_sh = false;
            for (index, splat) in pending.iter().enumerate() {
                self.write_splat(index, splat)?;
            }
        }
        for section in 0..self.published.len() {
            if !self.published[section] {
                self.publish(section)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ChunkReceiver;
    use crate::dot_splat::DotSplatDecoder;
    use crate::ply::tests::PlyBuilder;
    use crate::ply::PlyDecoder;

    fn splat(i: usize) -> SplatRecord {
        let f = i as f32;
        SplatRecord::from_components([f, 0.0, -f], [0.1; 3], [1.0, 0.0, 0.0, 0.0], [f, 2.0, 3.0], 200.0, &[0.25; 9])
    }

    #[test]
    fn test_sections_publish_in_order() {
        let mut receiver = ProgressiveSplatBuffer::new(ProgressiveOptions { section_size: 4, max_sh_degree: 1 });
        receiver.init_splats(&SplatInit { num_splats: 10, sh_degree: 2, deferred_sh: false }).unwrap();
        let buffer = receiver.buffer().unwrap();
        assert_eq!(buffer.max_section_count(), 3);
        assert_eq!(buffer.sh_degree(), 1);

        let mut seen = Vec::new();
        for i in 0..10 {
            receiver.set_splat(i, splat(i)).unwrap();
            seen.push(buffer.splat_count());
        }
        assert_eq!(seen, vec![0, 0, 0, 4, 4, 4, 4, 8, 8, 10]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        receiver.finish().unwrap();
        assert_eq!(buffer.section_count(), 3);
        assert_eq!(buffer.get_splat_center(9, None).to_array(), [9.0, 0.0, -9.0]);
        assert_eq!(buffer.get_splat_record(5).sh()[8], 0.25);
        assert!(receiver.set_splat(0, splat(0)).is_err());
    }

    #[test]
    fn test_repeated_write_does_not_publish_early() {
        let mut receiver = ProgressiveSplatBuffer::new(ProgressiveOptions { section_size: 3, max_sh_degree: 0 });
        receiver.init_splats(&SplatInit { num_splats: 3, sh_degree: 0, deferred_sh: false }).unwrap();
        let buffer = receiver.buffer().unwrap();
        receiver.set_splat(0, splat(0)).unwrap();
        receiver.set_splat(1, splat(1)).unwrap();
        receiver.set_splat(1, splat(5)).unwrap();
        assert_eq!(buffer.splat_count(), 0);
        receiver.set_splat(2, splat(2)).unwrap();
        assert_eq!(buffer.splat_count(), 3);
        assert_eq!(buffer.get_splat_center(1, None).x, 5.0);
    }

    #[test]
    fn test_deferred_sh_waits_for_finish() {
        let mut receiver = ProgressiveSplatBuffer::new(ProgressiveOptions { section_size: 2, max_sh_degree: 2 });
        receiver.init_splats(&SplatInit { num_splats: 2, sh_degree: 1, deferred_sh: true }).unwrap();
        let buffer = receiver.buffer().unwrap();
        receiver.set_splat(0, splat(0)).unwrap();
        receiver.set_splat(1, splat(1)).unwrap();
        assert_eq!(buffer.splat_count(), 0);
        receiver.set_sh(1, &[0.5; 9]).unwrap();
        receiver.finish().unwrap();
        assert_eq!(buffer.splat_count(), 2);
        assert_eq!(buffer.get_splat_record(1).sh(), &[0.5; 9]);
        assert_eq!(buffer.get_splat_record(0).sh(), &[0.25; 9]);
    }

    #[test]
    fn test_unknown_count_builds_at_finish() {
        let mut bytes = Vec::new();
        for i in 0..3 {
            bytes.extend_from_slice(&(i as f32).to_le_bytes());
            bytes.extend_from_slice(&[0u8; 20]);
            bytes.extend_from_slice(&[10, 20, 30, 255, 255, 128, 128, 128]);
        }
        let mut decoder = DotSplatDecoder::new(ProgressiveSplatBuffer::new(ProgressiveOptions::default()));
        decoder.push(&bytes).unwrap();
        decoder.finish().unwrap();
        let buffer = decoder.into_splats().into_buffer().unwrap();
        assert_eq!(buffer.splat_count(), 3);
        assert_eq!(buffer.get_splat_center(2, None).x, 2.0);
        assert_eq!(buffer.get_splat_color(1), [10, 20, 30, 255]);
    }

    #[test]
    fn test_streams_from_ply() {
        let mut builder = PlyBuilder::new().element("vertex", 5, &[("float", "x"), ("float", "y"), ("float", "z")]);
        for i in 0..5 {
            builder = builder.f32(i as f32).f32(1.0).f32(2.0);
        }
        let bytes = builder.build();
        let receiver = ProgressiveSplatBuffer::new(ProgressiveOptions { section_size: 2, max_sh_degree: 0 });
        let mut decoder = PlyDecoder::new(receiver);
        decoder.push(&bytes[..bytes.len() - 12]).unwrap();
        let buffer = decoder.splats().buffer().unwrap();
        assert_eq!(buffer.splat_count(), 4);
        decoder.push(&bytes[bytes.len() - 12..]).unwrap();
        decoder.finish().unwrap();
        assert_eq!(buffer.splat_count(), 5);
        assert_eq!(buffer.get_splat_color(4)[3], 255);
    }
}
