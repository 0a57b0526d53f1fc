//! Blocking loaders that stream a reader through the format decoders.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decoder::{ChunkReceiver, MultiDecoder, SplatFileType};
use crate::splat_buffer::{
    EncodeOptions, KSplatDecoder, ProgressiveOptions, ProgressiveSplatBuffer, SplatBuffer, SplatBufferGenerator,
};
use crate::uncompressed::UncompressedSplatArray;

/// Shared flag checked between chunks. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("load cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadOptions {
    pub file_type: Option<SplatFileType>,
    /// Used to pick the format from its extension.
    pub path_name: Option<String>,
    /// Source length, when known, for progress and `.splat` sizing.
    pub total_bytes: Option<usize>,
    pub chunk_size: usize,
    pub progressive: ProgressiveOptions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            file_type: None,
            path_name: None,
            total_bytes: None,
            chunk_size: 64 * 1024,
            progressive: ProgressiveOptions::default(),
        }
    }
}

impl LoadOptions {
    fn resolved_file_type(&self) -> Option<SplatFileType> {
        self.file_type
            .or_else(|| self.path_name.as_deref().and_then(SplatFileType::from_path))
    }
}

#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub bytes_read: usize,
    pub total_bytes: Option<usize>,
    /// Splats readable in the shared buffer so far.
    pub splats_loaded: usize,
    /// The buffer being filled, once the splat count is known. Splats below
    /// `splats_loaded` can be read while the load continues.
    pub buffer: Option<Arc<SplatBuffer>>,
}

impl LoadProgress {
    pub fn percent(&self) -> Option<f32> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_read as f32 / total as f32 * 100.0).min(100.0))
    }
}

/// Pump `reader` into `receiver` until EOF, checking `abort` per chunk.
fn pump<R: Read, C: ChunkReceiver>(
    mut reader: R,
    receiver: &mut C,
    options: &LoadOptions,
    abort: &AbortHandle,
    mut on_chunk: impl FnMut(&C, usize),
) -> Result<(), LoadError> {
    let mut chunk = vec![0u8; options.chunk_size.max(1)];
    let mut bytes_read = 0;
    loop {
        if abort.is_aborted() {
            log::info!("Load aborted after {} bytes", bytes_read);
            return Err(LoadError::Cancelled);
        }
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        receiver.push(&chunk[..n])?;
        bytes_read += n;
        on_chunk(receiver, bytes_read);
    }
    receiver.finish()?;
    log::debug!("Read {} bytes", bytes_read);
    Ok(())
}

/// Stream a `.ply`, `.splat` or `.ksplat` source into a shared buffer.
/// Sections become readable as they complete; `on_progress` is called after
/// every chunk with the shared buffer and its currently published splat count.
pub fn load_splat_buffer<R: Read>(
    reader: R,
    options: &LoadOptions,
    abort: &AbortHandle,
    mut on_progress: impl FnMut(&LoadProgress),
) -> Result<Arc<SplatBuffer>, LoadError> {
    let total_bytes = options.total_bytes;
    let mut report = |bytes_read: usize, buffer: Option<Arc<SplatBuffer>>| {
        let splats_loaded = buffer.as_ref().map_or(0, |b| b.splat_count());
        on_progress(&LoadProgress { bytes_read, total_bytes, splats_loaded, buffer });
    };

    if options.resolved_file_type() == Some(SplatFileType::KSplat) {
        let mut decoder = KSplatDecoder::new();
        pump(reader, &mut decoder, options, abort, |d, n| report(n, d.buffer()))?;
        return Ok(decoder.into_buffer()?);
    }

    let receiver = ProgressiveSplatBuffer::new(options.progressive.clone());
    let mut decoder = MultiDecoder::new(receiver, options.file_type, options.path_name.as_deref());
    if let Some(total_bytes) = total_bytes {
        decoder = decoder.with_size_hint(total_bytes);
    }
    pump(reader, &mut decoder, options, abort, |d, n| {
        report(n, d.splats().and_then(ProgressiveSplatBuffer::buffer))
    })?;
    Ok(decoder.into_splats()?.into_buffer()?)
}

/// Read a whole source and re-encode it with `encode`. A `.ksplat` source is
/// decoded section by section so its partitioning survives.
pub fn load_and_encode<R: Read>(
    reader: R,
    options: &LoadOptions,
    encode: &EncodeOptions,
    abort: &AbortHandle,
) -> Result<SplatBuffer, LoadError> {
    let arrays = if options.resolved_file_type() == Some(SplatFileType::KSplat) {
        let mut decoder = KSplatDecoder::new();
        pump(reader, &mut decoder, options, abort, |_, _| {})?;
        decoder.into_buffer()?.to_uncompressed_arrays()
    } else {
        let array = UncompressedSplatArray::new(options.progressive.max_sh_degree);
        let mut decoder = MultiDecoder::new(array, options.file_type, options.path_name.as_deref());
        if let Some(total_bytes) = options.total_bytes {
            decoder = decoder.with_size_hint(total_bytes);
        }
        pump(reader, &mut decoder, options, abort, |_, _| {})?;
        vec![decoder.into_splats()?]
    };
    if abort.is_aborted() {
        return Err(LoadError::Cancelled);
    }
    Ok(SplatBufferGenerator::new(encode.clone()).generate(&arrays)?)
}
