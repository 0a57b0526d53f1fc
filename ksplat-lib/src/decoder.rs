use serde::{Deserialize, Serialize};

use crate::dot_splat::DotSplatDecoder;
use crate::ply::PlyDecoder;
use crate::uncompressed::SplatRecord;

/// Byte sink for streaming decoders. Bytes may arrive in chunks of any size.
pub trait ChunkReceiver {
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
    fn finish(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SplatInit {
    pub num_splats: usize,
    pub sh_degree: usize,
    /// SH coefficients arrive in a later pass through `set_sh`.
    pub deferred_sh: bool,
}

pub trait SplatReceiver {
    fn init_splats(&mut self, init: &SplatInit) -> anyhow::Result<()>;
    /// Highest SH degree the receiver keeps. Decoders skip anything above it.
    fn max_sh_degree(&self) -> usize;
    fn set_splat(&mut self, index: usize, splat: SplatRecord) -> anyhow::Result<()>;
    fn set_sh(&mut self, index: usize, sh: &[f32]) -> anyhow::Result<()>;
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplatFileType {
    Ply,
    Splat,
    KSplat,
}

impl SplatFileType {
    pub fn from_enum_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ply" => Ok(Self::Ply),
            "splat" => Ok(Self::Splat),
            "ksplat" => Ok(Self::KSplat),
            _ => Err(anyhow::anyhow!("Invalid file type: {}", s)),
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let (_, extension) = path.rsplit_once('.')?;
        Self::from_enum_str(extension).ok()
    }

    /// Guess from the leading bytes. Only PLY carries a magic; anything else
    /// needs a path or an explicit type.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"ply\n") || bytes.starts_with(b"ply\r\n") {
            Some(Self::Ply)
        } else {
            None
        }
    }
}

enum MultiInner<T: SplatReceiver> {
    Detecting(T),
    Ply(PlyDecoder<T>),
    Splat(DotSplatDecoder<T>),
    Empty,
}

/// Decoder for `.ply` and `.splat` sources that picks the concrete decoder
/// from an explicit type, the path extension, or the stream's magic.
pub struct MultiDecoder<T: SplatReceiver> {
    inner: MultiInner<T>,
    file_type: Option<SplatFileType>,
    size_hint: Option<usize>,
    buffer: Vec<u8>,
}

impl<T: SplatReceiver> MultiDecoder<T> {
    pub fn new(splats: T, file_type: Option<SplatFileType>, path_name: Option<&str>) -> Self {
        let file_type = file_type.or_else(|| path_name.and_then(SplatFileType::from_path));
        Self {
            inner: MultiInner::Detecting(splats),
            file_type,
            size_hint: None,
            buffer: Vec::new(),
        }
    }

    /// Total source length, forwarded to decoders that size their output from it.
    pub fn with_size_hint(mut self, total_bytes: usize) -> Self {
        self.size_hint = Some(total_bytes);
        self
    }

    pub fn file_type(&self) -> Option<SplatFileType> {
        self.file_type
    }

    pub fn splats(&self) -> Option<&T> {
        match &self.inner {
            MultiInner::Detecting(splats) => Some(splats),
            MultiInner::Ply(decoder) => Some(decoder.splats()),
            MultiInner::Splat(decoder) => Some(decoder.splats()),
            MultiInner::Empty => None,
        }
    }

    pub fn into_splats(self) -> anyhow::Result<T> {
        match self.inner {
            MultiInner::Detecting(splats) => Ok(splats),
            MultiInner::Ply(decoder) => Ok(decoder.into_splats()),
            MultiInner::Splat(decoder) => Ok(decoder.into_splats()),
            MultiInner::Empty => Err(anyhow::anyhow!("Decoder is in an invalid state")),
        }
    }

    fn start(&mut self, file_type: SplatFileType) -> anyhow::Result<()> {
        let MultiInner::Detecting(splats) = std::mem::replace(&mut self.inner, MultiInner::Empty) else {
            return Ok(());
        };
        self.file_type = Some(file_type);
        self.inner = match file_type {
            SplatFileType::Ply => MultiInner::Ply(PlyDecoder::new(splats)),
            SplatFileType::Splat => {
                let mut decoder = DotSplatDecoder::new(splats);
                if let Some(total_bytes) = self.size_hint {
                    decoder.set_size_hint(total_bytes);
                }
                MultiInner::Splat(decoder)
            }
            SplatFileType::KSplat => {
                return Err(anyhow::anyhow!("KSplat sources are read with KSplatDecoder"));
            }
        };
        let buffered = std::mem::take(&mut self.buffer);
        self.push_inner(&buffered)
    }

    fn push_inner(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        match &mut self.inner {
            MultiInner::Ply(decoder) => decoder.push(bytes),
            MultiInner::Splat(decoder) => decoder.push(bytes),
            _ => Err(anyhow::anyhow!("Decoder not started")),
        }
    }
}

impl<T: SplatReceiver> ChunkReceiver for MultiDecoder<T> {
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        if let MultiInner::Detecting(_) = self.inner {
            self.buffer.extend_from_slice(bytes);
            if let Some(file_type) = self.file_type {
                return self.start(file_type);
            }
            if self.buffer.len() < 4 {
                return Ok(());
            }
            // No magic and no hint: the flat .splat layout is the only headerless format.
            let file_type = SplatFileType::detect(&self.buffer).unwrap_or(SplatFileType::Splat);
            return self.start(file_type);
        }
        self.push_inner(bytes)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let MultiInner::Detecting(_) = self.inner {
            let file_type = self
                .file_type
                .or_else(|| SplatFileType::detect(&self.buffer))
                .unwrap_or(SplatFileType::Splat);
            self.start(file_type)?;
        }
        match &mut self.inner {
            MultiInner::Ply(decoder) => decoder.finish(),
            MultiInner::Splat(decoder) => decoder.finish(),
            _ => Err(anyhow::anyhow!("Decoder not started")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uncompressed::UncompressedSplatArray;

    #[test]
    fn test_file_type_from_path() {
        assert_eq!(SplatFileType::from_path("scene/garden.PLY"), Some(SplatFileType::Ply));
        assert_eq!(SplatFileType::from_path("a.b.ksplat"), Some(SplatFileType::KSplat));
        assert_eq!(SplatFileType::from_path("noextension"), None);
        assert_eq!(SplatFileType::from_path("archive.zip"), None);
    }

    #[test]
    fn test_detect_magic() {
        assert_eq!(SplatFileType::detect(b"ply\nformat"), Some(SplatFileType::Ply));
        assert_eq!(SplatFileType::detect(&[0u8; 32]), None);
    }

    #[test]
    fn test_multi_decoder_headerless_is_splat() {
        let mut record = [0u8; 32];
        record[0..4].copy_from_slice(&1.0f32.to_le_bytes());
        record[12..16].copy_from_slice(&0.5f32.to_le_bytes());
        record[24..28].copy_from_slice(&[255, 128, 0, 200]);
        record[28..32].copy_from_slice(&[255, 128, 128, 128]);

        let mut decoder = MultiDecoder::new(UncompressedSplatArray::new(0), None, None);
        decoder.push(&record[..3]).unwrap();
        decoder.push(&record[3..]).unwrap();
        decoder.finish().unwrap();
        assert_eq!(decoder.file_type(), Some(SplatFileType::Splat));
        let splats = decoder.into_splats().unwrap();
        assert_eq!(splats.splat_count(), 1);
        assert_eq!(splats.get(0).center().x, 1.0);
        assert_eq!(splats.get(0).opacity(), 200.0);
    }

    #[test]
    fn test_multi_decoder_rejects_ksplat() {
        let mut decoder = MultiDecoder::new(UncompressedSplatArray::new(0), None, Some("x.ksplat"));
        assert!(decoder.push(&[0u8; 8]).is_err());
    }
}
