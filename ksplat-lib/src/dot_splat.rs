use std::ops::Range;

use crate::decoder::{ChunkReceiver, SplatInit, SplatReceiver};
use crate::uncompressed::{normalize_rotation, SplatRecord, UncompressedSplatArray};

/// Flat `.splat` record: 3×f32 center, 3×f32 scale, RGBA bytes, rotation bytes (w, x, y, z).
pub const SPLAT_RECORD_BYTES: usize = 32;

fn read_f32x3(bytes: &[u8]) -> [f32; 3] {
    [
        f32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        f32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        f32::from_le_bytes(bytes[8..12].try_into().unwrap()),
    ]
}

/// Rotation bytes mapped to `[-1, 1)` without normalization, in `[w, x, y, z]` order.
pub fn decode_rotation_bytes(bytes: [u8; 4]) -> [f32; 4] {
    bytes.map(|b| (b as f32 - 128.0) / 128.0)
}

pub fn decode_splat_record(record: &[u8]) -> SplatRecord {
    let center = read_f32x3(&record[0..12]);
    let scale = read_f32x3(&record[12..24]);
    let rgba = &record[24..28];
    let rotation = decode_rotation_bytes(record[28..32].try_into().unwrap());
    SplatRecord::from_components(
        center,
        scale,
        normalize_rotation(rotation),
        [rgba[0] as f32, rgba[1] as f32, rgba[2] as f32],
        rgba[3] as f32,
        &[],
    )
}

pub fn splat_count(bytes: &[u8]) -> usize {
    bytes.len() / SPLAT_RECORD_BYTES
}

/// Parse the records in `rows` of a complete `.splat` buffer.
pub fn parse_rows<T: SplatReceiver>(bytes: &[u8], rows: Range<usize>, splats: &mut T) -> anyhow::Result<()> {
    let count = splat_count(bytes);
    if rows.end > count {
        return Err(anyhow::anyhow!("Row range {:?} exceeds splat count {}", rows, count));
    }
    for (index, row) in rows.clone().enumerate() {
        let start = row * SPLAT_RECORD_BYTES;
        splats.set_splat(index, decode_splat_record(&bytes[start..start + SPLAT_RECORD_BYTES]))?;
    }
    Ok(())
}

pub fn parse_splat(bytes: &[u8]) -> anyhow::Result<UncompressedSplatArray> {
    let count = splat_count(bytes);
    let mut splats = UncompressedSplatArray::with_capacity(0, count);
    splats.init_splats(&SplatInit { num_splats: count, ..Default::default() })?;
    parse_rows(bytes, 0..count, &mut splats)?;
    Ok(splats)
}

pub struct DotSplatDecoder<T: SplatReceiver> {
    splats: T,
    buffer: Vec<u8>,
    size_hint: Option<usize>,
    initialized: bool,
    next: usize,
}

impl<T: SplatReceiver> DotSplatDecoder<T> {
    pub fn new(splats: T) -> Self {
        Self {
            splats,
            buffer: Vec::new(),
            size_hint: None,
            initialized: false,
            next: 0,
        }
    }

    /// Total byte length of the source, when known, so the receiver can be
    /// sized before the first record arrives.
    pub fn with_size_hint(mut self, total_bytes: usize) -> Self {
        self.size_hint = Some(total_bytes);
        self
    }

    pub fn set_size_hint(&mut self, total_bytes: usize) {
        self.size_hint = Some(total_bytes);
    }

    pub fn splats(&self) -> &T {
        &self.splats
    }

    pub fn into_splats(self) -> T {
        self.splats
    }

    fn poll(&mut self) -> anyhow::Result<()> {
        if !self.initialized {
            let num_splats = self.size_hint.map(|size| size / SPLAT_RECORD_BYTES).unwrap_or(0);
            self.splats.init_splats(&SplatInit { num_splats, ..Default::default() })?;
            self.initialized = true;
        }

        let complete = self.buffer.len() / SPLAT_RECORD_BYTES;
        for record in self.buffer[..complete * SPLAT_RECORD_BYTES].chunks_exact(SPLAT_RECORD_BYTES) {
            self.splats.set_splat(self.next, decode_splat_record(record))?;
            self.next += 1;
        }
        self.buffer.drain(..complete * SPLAT_RECORD_BYTES);
        Ok(())
    }
}

impl<T: SplatReceiver> ChunkReceiver for DotSplatDecoder<T> {
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.poll()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.poll()?;
        if let Some(expected) = self.size_hint.map(|size| size / SPLAT_RECORD_BYTES) {
            if self.next < expected {
                return Err(anyhow::anyhow!("Splat stream ended after {} of {} records", self.next, expected));
            }
        }
        if !self.buffer.is_empty() {
            log::warn!("Ignoring {} trailing bytes after last .splat record", self.buffer.len());
        }
        self.splats.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(center: [f32; 3], scale: [f32; 3], rgba: [u8; 4], rot: [u8; 4]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SPLAT_RECORD_BYTES);
        for v in center.iter().chain(scale.iter()) {
            bytes.extend(v.to_le_bytes());
        }
        bytes.extend(rgba);
        bytes.extend(rot);
        bytes
    }

    #[test]
    fn test_rotation_bytes_at_midpoint_are_zero() {
        assert_eq!(decode_rotation_bytes([128; 4]), [0.0; 4]);
        let bytes = record([0.0; 3], [1.0; 3], [0; 4], [128; 4]);
        let splat = decode_splat_record(&bytes);
        assert_eq!(splat.rotation(), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_parse_splat() {
        let mut bytes = record([1.0, 2.0, 3.0], [0.1, 0.2, 0.3], [10, 20, 30, 40], [255, 128, 128, 128]);
        bytes.extend(record([-1.0, 0.0, 0.0], [1.0; 3], [0, 0, 0, 255], [128, 255, 128, 128]));
        bytes.extend([0u8; 7]);
        let splats = parse_splat(&bytes).unwrap();
        assert_eq!(splats.splat_count(), 2);
        let first = splats.get(0);
        assert_eq!(first.center().to_array(), [1.0, 2.0, 3.0]);
        assert_eq!(first.color(), [10.0, 20.0, 30.0]);
        assert_eq!(first.opacity(), 40.0);
        assert_eq!(first.rotation(), [1.0, 0.0, 0.0, 0.0]);
        let second = splats.get(1).rotation();
        assert!((second[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_streaming_matches_whole_parse() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend(record([i as f32, 0.0, 0.0], [1.0; 3], [1, 2, 3, 4], [200, 100, 50, 128]));
        }
        let mut decoder = DotSplatDecoder::new(UncompressedSplatArray::new(0)).with_size_hint(bytes.len());
        for chunk in bytes.chunks(7) {
            decoder.push(chunk).unwrap();
        }
        decoder.finish().unwrap();
        let streamed = decoder.into_splats();
        let whole = parse_splat(&bytes).unwrap();
        assert_eq!(streamed.splats(), whole.splats());
    }

    #[test]
    fn test_truncated_stream_fails() {
        let bytes = record([0.0; 3], [1.0; 3], [0; 4], [128; 4]);
        let mut decoder = DotSplatDecoder::new(UncompressedSplatArray::new(0)).with_size_hint(64);
        decoder.push(&bytes).unwrap();
        assert!(decoder.finish().is_err());
    }
}
