use std::sync::Arc;

use anyhow::anyhow;

use super::header::{SectionHeader, SplatBufferHeader, HEADER_SIZE_BYTES, SECTION_HEADER_SIZE_BYTES};
use super::SplatBuffer;
use crate::decoder::ChunkReceiver;

/// Streaming reader for `.ksplat` bytes. The container becomes available
/// after the section headers arrive and each section is published as soon
/// as its storage is complete.
#[derive(Default)]
pub struct KSplatDecoder {
    pending: Vec<u8>,
    header: Option<SplatBufferHeader>,
    buffer: Option<Arc<SplatBuffer>>,
    next_section: usize,
    loaded_splats: usize,
}

impl KSplatDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<&SplatBufferHeader> {
        self.header.as_ref()
    }

    pub fn buffer(&self) -> Option<Arc<SplatBuffer>> {
        self.buffer.clone()
    }

    pub fn into_buffer(self) -> anyhow::Result<Arc<SplatBuffer>> {
        self.buffer.ok_or_else(|| anyhow!("KSplat stream ended before its section headers"))
    }

    fn poll(&mut self) -> anyhow::Result<()> {
        if self.header.is_none() {
            if self.pending.len() < HEADER_SIZE_BYTES {
                return Ok(());
            }
            self.header = Some(SplatBufferHeader::read(&self.pending)?);
            self.pending.drain(..HEADER_SIZE_BYTES);
        }
        let Some(header) = self.header.as_ref() else {
            return Ok(());
        };

        if self.buffer.is_none() {
            let section_count = header.max_section_count as usize;
            let size = section_count * SECTION_HEADER_SIZE_BYTES;
            if self.pending.len() < size {
                return Ok(());
            }
            let sections = self.pending[..size]
                .chunks_exact(SECTION_HEADER_SIZE_BYTES)
                .map(|bytes| SectionHeader::read(bytes, header.compression_level))
                .collect::<anyhow::Result<Vec<_>>>()?;
            self.buffer = Some(Arc::new(SplatBuffer::new(header.clone(), sections)?));
            self.pending.drain(..size);
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return Ok(());
        };

        let mut offset = 0;
        while self.next_section < buffer.max_section_count() {
            let section = buffer.section(self.next_section).header();
            let storage = section.storage_size_bytes as usize;
            if self.pending.len() - offset < storage {
                break;
            }
            buffer.load_section_bytes(self.next_section, &self.pending[offset..offset + storage])?;
            buffer.update_section_loaded_count(self.next_section, section.splat_count as usize)?;
            self.loaded_splats += section.splat_count as usize;
            self.next_section += 1;
            offset += storage;

            let published_sections = self.next_section.min(header.section_count as usize);
            let published_splats = self.loaded_splats.min(header.splat_count as usize);
            buffer.update_loaded_counts(published_sections, published_splats);
            log::debug!("Loaded ksplat section {} ({} splats)", self.next_section - 1, published_splats);
        }
        self.pending.drain(..offset);
        Ok(())
    }
}

impl ChunkReceiver for KSplatDecoder {
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.pending.extend_from_slice(bytes);
        self.poll()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.poll()?;
        let Some(buffer) = self.buffer.as_ref() else {
            return Err(anyhow!("KSplat stream ended before its section headers"));
        };
        if self.next_section < buffer.max_section_count() {
            return Err(anyhow!(
                "KSplat stream ended after {} of {} sections",
                self.next_section,
                buffer.max_section_count()
            ));
        }
        if !self.pending.is_empty() {
            log::warn!("Ignoring {} trailing bytes after last ksplat section", self.pending.len());
        }
        Ok(())
    }
}
