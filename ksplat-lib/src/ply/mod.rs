use std::ops::Range;

use ahash::HashMap;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::decoder::{ChunkReceiver, SplatInit, SplatReceiver};
use crate::uncompressed::UncompressedSplatArray;

mod codebook;
mod inria;
mod playcanvas;

pub use codebook::CodeBook;

pub const SH_C0: f32 = 0.28209479177387814;
/// `end_header` must appear within this many bytes.
pub const PLY_HEADER_WINDOW: usize = 65536;
const MAX_ROWS_PER_POLL: usize = 65536;

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn to_color_byte(v: f32) -> f32 {
    (v * 255.0).floor().clamp(0.0, 255.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyPropertyType {
    Char,
    Uchar,
    Short,
    Ushort,
    Int,
    Uint,
    Half,
    Float,
    Double,
}

impl PlyPropertyType {
    pub fn parse(token: &str) -> anyhow::Result<Self> {
        Ok(match token {
            "char" | "int8" => Self::Char,
            "uchar" | "uint8" => Self::Uchar,
            "short" | "int16" => Self::Short,
            "ushort" | "uint16" => Self::Ushort,
            "int" | "int32" => Self::Int,
            "uint" | "uint32" => Self::Uint,
            "half" | "float16" => Self::Half,
            "float" | "float32" => Self::Float,
            "double" | "float64" => Self::Double,
            _ => return Err(anyhow!("Unsupported PLY property type: {}", token)),
        })
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Char | Self::Uchar => 1,
            Self::Short | Self::Ushort | Self::Half => 2,
            Self::Int | Self::Uint | Self::Float => 4,
            Self::Double => 8,
        }
    }

    /// Numeric value without any normalization.
    pub fn get_f32(&self, data: &[u8], offset: usize) -> f32 {
        match self {
            Self::Char => data[offset] as i8 as f32,
            Self::Uchar => data[offset] as f32,
            Self::Short => i16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as f32,
            Self::Ushort => u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as f32,
            Self::Int => i32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as f32,
            Self::Uint => u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as f32,
            Self::Half => half::f16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()).to_f32(),
            Self::Float => f32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()),
            Self::Double => f64::from_le_bytes(data[offset..offset + 8].try_into().unwrap()) as f32,
        }
    }

    pub fn get_u32(&self, data: &[u8], offset: usize) -> u32 {
        match self {
            Self::Char => data[offset] as i8 as u32,
            Self::Uchar => data[offset] as u32,
            Self::Short => i16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as u32,
            Self::Ushort | Self::Half => u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as u32,
            Self::Int => i32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as u32,
            Self::Uint => u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()),
            Self::Float => f32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as u32,
            Self::Double => f64::from_le_bytes(data[offset..offset + 8].try_into().unwrap()) as u32,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlyProperty {
    pub ty: PlyPropertyType,
    pub offset: usize,
}

impl PlyProperty {
    pub fn get_f32(&self, data: &[u8], record_offset: usize) -> f32 {
        self.ty.get_f32(data, record_offset + self.offset)
    }

    pub fn get_u32(&self, data: &[u8], record_offset: usize) -> u32 {
        self.ty.get_u32(data, record_offset + self.offset)
    }

    pub fn get_index(&self, data: &[u8], record_offset: usize) -> usize {
        self.get_u32(data, record_offset) as usize
    }
}

#[derive(Debug, Clone)]
pub struct PlyElement {
    pub name: String,
    pub count: usize,
    pub record_size: usize,
    pub properties: HashMap<String, PlyProperty>,
}

impl PlyElement {
    fn new(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            count,
            record_size: 0,
            properties: HashMap::default(),
        }
    }

    fn add_property(&mut self, name: &str, ty: PlyPropertyType) {
        self.properties.insert(name.to_string(), PlyProperty { ty, offset: self.record_size });
        self.record_size += ty.size();
    }

    pub fn get(&self, name: &str) -> Option<PlyProperty> {
        self.properties.get(name).copied()
    }

    pub fn require(&self, name: &str) -> anyhow::Result<PlyProperty> {
        self.get(name)
            .ok_or_else(|| anyhow!("Missing property {} in PLY element {}", name, self.name))
    }

    /// Number of contiguous `{prefix}{i}` properties starting at 0.
    pub fn count_indexed(&self, prefix: &str) -> usize {
        (0..).take_while(|i| self.properties.contains_key(&format!("{}{}", prefix, i))).count()
    }

    pub fn byte_len(&self) -> usize {
        self.count * self.record_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlyFormat {
    /// Named per-splat fields, optionally with SH and with RGB color fallback.
    Generic,
    /// Per-splat indices into a 256-entry codebook element.
    Codebook,
    /// Chunk-quantized packed fields.
    PlayCanvasCompressed,
}

impl PlyFormat {
    pub fn detect(header_text: &str) -> Option<Self> {
        if header_text.contains("element chunk") || header_text.contains("packed_") {
            Some(Self::PlayCanvasCompressed)
        } else if header_text.contains("element codebook_centers") {
            Some(Self::Codebook)
        } else if header_text.contains("element vertex") {
            Some(Self::Generic)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlyHeader {
    pub format: PlyFormat,
    pub elements: Vec<PlyElement>,
    /// Bytes up to and including the line holding `end_header`.
    pub header_size: usize,
}

impl PlyHeader {
    pub fn element(&self, name: &str) -> Option<&PlyElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn splat_count(&self) -> usize {
        self.element("vertex").map(|e| e.count).unwrap_or(0)
    }

    /// Parse the header at the start of `bytes`. Returns `None` when more
    /// bytes are needed to reach `end_header`.
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Option<Self>> {
        const TERMINATOR: &[u8] = b"end_header";
        let window = &bytes[..bytes.len().min(PLY_HEADER_WINDOW)];
        let Some(end) = window.windows(TERMINATOR.len()).position(|w| w == TERMINATOR) else {
            if bytes.len() >= PLY_HEADER_WINDOW {
                return Err(anyhow!("PLY end_header not found within {} bytes", PLY_HEADER_WINDOW));
            }
            return Ok(None);
        };
        let Some(newline) = bytes[end..].iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let header_size = end + newline + 1;
        let text = std::str::from_utf8(&bytes[..end])?;
        let format = PlyFormat::detect(text).ok_or_else(|| anyhow!("PLY file has no splat elements"))?;
        let elements = parse_elements(text)?;
        Ok(Some(Self { format, elements, header_size }))
    }
}

fn parse_elements(text: &str) -> anyhow::Result<Vec<PlyElement>> {
    let mut elements: Vec<PlyElement> = Vec::new();
    let mut format_seen = false;

    for (line_index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line_index == 0 {
            if line != "ply" {
                return Err(anyhow!("Invalid PLY header"));
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let fields: Vec<_> = line.split_whitespace().collect();
        match fields[0] {
            "format" if fields.len() == 3 => {
                format_seen = true;
                if fields[1] != "binary_little_endian" {
                    return Err(anyhow!("Unsupported PLY format: {}", fields[1]));
                }
                if fields[2] != "1.0" {
                    return Err(anyhow!("Unsupported PLY version: {}", fields[2]));
                }
            },
            "comment" | "obj_info" => {},
            "element" if fields.len() == 3 => {
                elements.push(PlyElement::new(fields[1], fields[2].parse()?));
            },
            "property" => {
                if fields.get(1) == Some(&"list") {
                    return Err(anyhow!("PLY list properties are not supported"));
                }
                if fields.len() != 3 {
                    return Err(anyhow!("Invalid property line: {}", line));
                }
                let Some(element) = elements.last_mut() else {
                    return Err(anyhow!("Property outside of element"));
                };
                element.add_property(fields[2], PlyPropertyType::parse(fields[1])?);
            },
            _ => return Err(anyhow!("Unsupported PLY header line: {}", line)),
        }
    }

    if !format_seen {
        return Err(anyhow!("Missing PLY format line"));
    }
    Ok(elements)
}

/// Reads the leading bytes of a PLY file in fixed-size probes until the
/// header terminator shows up, and reports the variant.
pub fn detect_ply_format(bytes: &[u8]) -> anyhow::Result<PlyFormat> {
    const PROBE: usize = 100;
    let mut end = 0;
    loop {
        if end >= bytes.len() {
            return Err(anyhow!("End of file reached while searching for end of header"));
        }
        end = (end + PROBE).min(bytes.len());
        if let Some(header) = PlyHeader::parse(&bytes[..end])? {
            return Ok(header.format);
        }
    }
}

/// Variant-specific decode state shared by streaming and row-range parsing.
enum PlyContent {
    Generic(inria::InriaLayout),
    Codebook(codebook::CodebookState),
    PlayCanvas(playcanvas::PlayCanvasState),
}

impl PlyContent {
    fn new(header: &PlyHeader, max_sh_degree: usize) -> anyhow::Result<Self> {
        let vertex = header.element("vertex").ok_or_else(|| anyhow!("Missing vertex element"))?;
        Ok(match header.format {
            PlyFormat::Generic => Self::Generic(inria::InriaLayout::new(vertex, max_sh_degree)?),
            PlyFormat::Codebook => Self::Codebook(codebook::CodebookState::new(header, max_sh_degree)?),
            PlyFormat::PlayCanvasCompressed => {
                Self::PlayCanvas(playcanvas::PlayCanvasState::new(header, max_sh_degree)?)
            },
        })
    }

    fn init(&self, header: &PlyHeader, num_splats: usize) -> SplatInit {
        let (sh_degree, deferred_sh) = match self {
            Self::Generic(layout) => (layout.sh_degree(), false),
            Self::Codebook(state) => (state.sh_degree(), false),
            Self::PlayCanvas(state) => (state.sh_degree(), state.sh_degree() > 0),
        };
        log::debug!(
            "PLY {:?}: {} splats, SH degree {}",
            header.format,
            header.splat_count(),
            sh_degree
        );
        SplatInit { num_splats, sh_degree, deferred_sh }
    }

    /// Decode `count` rows of `element` starting at `first_row`. `data` holds
    /// exactly those rows. Splat rows are delivered at `row - row_origin`,
    /// and rows outside `rows` are skipped.
    fn decode<T: SplatReceiver>(
        &mut self,
        element: &PlyElement,
        data: &[u8],
        first_row: usize,
        count: usize,
        rows: &Range<usize>,
        splats: &mut T,
    ) -> anyhow::Result<()> {
        match self {
            Self::Generic(layout) => {
                if element.name != "vertex" {
                    return Ok(());
                }
                for i in 0..count {
                    let row = first_row + i;
                    if rows.contains(&row) {
                        splats.set_splat(row - rows.start, layout.decode(data, i * element.record_size))?;
                    }
                }
            },
            Self::Codebook(state) => match element.name.as_str() {
                "codebook_centers" => state.add_codebook_rows(element, data, count),
                "vertex" => {
                    state.finish_codebook()?;
                    for i in 0..count {
                        let row = first_row + i;
                        if rows.contains(&row) {
                            splats.set_splat(row - rows.start, state.decode_vertex(data, i * element.record_size)?)?;
                        }
                    }
                },
                _ => {},
            },
            Self::PlayCanvas(state) => match element.name.as_str() {
                "chunk" => state.add_chunks(element, data, count),
                "vertex" => {
                    for i in 0..count {
                        let row = first_row + i;
                        if rows.contains(&row) {
                            let splat = state.decode_vertex(row, data, i * element.record_size)?;
                            splats.set_splat(row - rows.start, splat)?;
                        }
                    }
                },
                "sh" => {
                    let mut sh = Vec::new();
                    for i in 0..count {
                        let row = first_row + i;
                        if rows.contains(&row) {
                            state.decode_sh(data, i * element.record_size, &mut sh);
                            splats.set_sh(row - rows.start, &sh)?;
                        }
                    }
                },
                _ => {},
            },
        }
        Ok(())
    }
}

/// Streaming PLY decoder covering the generic, codebook and PlayCanvas variants.
pub struct PlyDecoder<T: SplatReceiver> {
    splats: T,
    buffer: Vec<u8>,
    max_sh_degree: Option<usize>,
    state: Option<PlyStreamState>,
}

struct PlyStreamState {
    header: PlyHeader,
    content: PlyContent,
    element_index: usize,
    rows_read: usize,
}

impl<T: SplatReceiver> PlyDecoder<T> {
    pub fn new(splats: T) -> Self {
        Self {
            splats,
            buffer: Vec::new(),
            max_sh_degree: None,
            state: None,
        }
    }

    /// Cap the SH degree below what the receiver would keep.
    pub fn with_max_sh_degree(mut self, max_sh_degree: usize) -> Self {
        self.max_sh_degree = Some(max_sh_degree);
        self
    }

    pub fn header(&self) -> Option<&PlyHeader> {
        self.state.as_ref().map(|s| &s.header)
    }

    pub fn splats(&self) -> &T {
        &self.splats
    }

    pub fn into_splats(self) -> T {
        self.splats
    }

    fn poll(&mut self) -> anyhow::Result<()> {
        if self.state.is_none() {
            self.poll_header()?;
        }
        if self.state.is_some() {
            self.poll_data()?;
        }
        Ok(())
    }

    fn poll_header(&mut self) -> anyhow::Result<()> {
        if self.buffer.len() < 4 {
            return Ok(());
        }
        if !self.buffer.starts_with(b"ply") {
            return Err(anyhow!("Invalid PLY file"));
        }
        let Some(header) = PlyHeader::parse(&self.buffer)? else {
            return Ok(());
        };

        let max_sh_degree = self
            .max_sh_degree
            .map_or(self.splats.max_sh_degree(), |d| d.min(self.splats.max_sh_degree()));
        let content = PlyContent::new(&header, max_sh_degree)?;
        self.splats.init_splats(&content.init(&header, header.splat_count()))?;

        self.buffer.drain(..header.header_size);
        self.state = Some(PlyStreamState { header, content, element_index: 0, rows_read: 0 });
        Ok(())
    }

    fn poll_data(&mut self) -> anyhow::Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let all_rows = 0..usize::MAX;
        let mut offset = 0;
        while state.element_index < state.header.elements.len() {
            let element = &state.header.elements[state.element_index];
            let remaining = element.count - state.rows_read;
            if remaining == 0 || element.record_size == 0 {
                state.element_index += 1;
                state.rows_read = 0;
                continue;
            }
            let available = (self.buffer.len() - offset) / element.record_size;
            let count = remaining.min(available).min(MAX_ROWS_PER_POLL);
            if count == 0 {
                break;
            }

            let end = offset + count * element.record_size;
            state.content.decode(
                element,
                &self.buffer[offset..end],
                state.rows_read,
                count,
                &all_rows,
                &mut self.splats,
            )?;
            state.rows_read += count;
            offset = end;
        }
        self.buffer.drain(..offset);
        Ok(())
    }
}

impl<T: SplatReceiver> ChunkReceiver for PlyDecoder<T> {
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.poll()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.poll()?;
        let Some(state) = self.state.as_ref() else {
            return Err(anyhow!("Invalid PLY file"));
        };
        if state.element_index < state.header.elements.len() {
            let element = &state.header.elements[state.element_index];
            return Err(anyhow!(
                "PLY element {} ended after {} of {} rows",
                element.name,
                state.rows_read,
                element.count
            ));
        }
        if !self.buffer.is_empty() {
            return Err(anyhow!("Unexpected data after PLY file"));
        }
        self.splats.finish()
    }
}

/// Parse a complete PLY buffer.
pub fn parse_ply(bytes: &[u8], max_sh_degree: usize) -> anyhow::Result<UncompressedSplatArray> {
    let header = PlyHeader::parse(bytes)?.ok_or_else(|| anyhow!("PLY header is incomplete"))?;
    let count = header.splat_count();
    parse_rows(bytes, 0..count, UncompressedSplatArray::with_capacity(max_sh_degree, count))
}

/// Parse only splat rows `rows` of a complete PLY buffer. Auxiliary elements
/// (codebook, chunk extents) are always read in full.
pub fn parse_rows<T: SplatReceiver>(bytes: &[u8], rows: Range<usize>, mut splats: T) -> anyhow::Result<T> {
    let header = PlyHeader::parse(bytes)?.ok_or_else(|| anyhow!("PLY header is incomplete"))?;
    if rows.end > header.splat_count() || rows.start > rows.end {
        return Err(anyhow!("Row range {:?} outside of {} splats", rows, header.splat_count()));
    }
    let mut content = PlyContent::new(&header, splats.max_sh_degree())?;
    splats.init_splats(&content.init(&header, rows.len()))?;

    let mut offset = header.header_size;
    for element in &header.elements {
        let end = offset + element.byte_len();
        if end > bytes.len() {
            return Err(anyhow!("PLY element {} truncated", element.name));
        }
        let data = &bytes[offset..end];
        match element.name.as_str() {
            "vertex" | "sh" => {
                let first = rows.start.min(element.count);
                let last = rows.end.min(element.count);
                let slice = &data[first * element.record_size..last * element.record_size];
                content.decode(element, slice, first, last - first, &rows, &mut splats)?;
            },
            _ => content.decode(element, data, 0, element.count, &rows, &mut splats)?,
        }
        offset = end;
    }
    splats.finish()?;
    Ok(splats)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal PLY writer for tests.
    pub(crate) struct PlyBuilder {
        header: String,
        body: Vec<u8>,
    }

    impl PlyBuilder {
        pub(crate) fn new() -> Self {
            Self {
                header: "ply\nformat binary_little_endian 1.0\ncomment test\n".to_string(),
                body: Vec::new(),
            }
        }

        pub(crate) fn element(mut self, name: &str, count: usize, props: &[(&str, &str)]) -> Self {
            self.header += &format!("element {} {}\n", name, count);
            for (ty, prop) in props {
                self.header += &format!("property {} {}\n", ty, prop);
            }
            self
        }

        pub(crate) fn f32(mut self, v: f32) -> Self {
            self.body.extend(v.to_le_bytes());
            self
        }

        pub(crate) fn u32(mut self, v: u32) -> Self {
            self.body.extend(v.to_le_bytes());
            self
        }

        pub(crate) fn u8(mut self, v: u8) -> Self {
            self.body.push(v);
            self
        }

        pub(crate) fn f16(mut self, v: f32) -> Self {
            self.body.extend(half::f16::from_f32(v).to_le_bytes());
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            let mut bytes = self.header.into_bytes();
            bytes.extend(b"end_header\n");
            bytes.extend(self.body);
            bytes
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(PlyFormat::detect("ply\nelement vertex 3\n"), Some(PlyFormat::Generic));
        assert_eq!(
            PlyFormat::detect("ply\nelement codebook_centers 256\nelement vertex 3\n"),
            Some(PlyFormat::Codebook)
        );
        assert_eq!(PlyFormat::detect("ply\nelement chunk 1\n"), Some(PlyFormat::PlayCanvasCompressed));
        assert_eq!(
            PlyFormat::detect("ply\nelement vertex 1\nproperty uint packed_position\n"),
            Some(PlyFormat::PlayCanvasCompressed)
        );
        assert_eq!(PlyFormat::detect("ply\nelement face 1\n"), None);
    }

    #[test]
    fn test_header_errors() {
        let ascii = b"ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nend_header\n";
        assert!(PlyHeader::parse(ascii).is_err());

        let bad_type = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty quad x\nend_header\n";
        assert!(PlyHeader::parse(bad_type).is_err());

        let incomplete = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\n";
        assert!(PlyHeader::parse(incomplete).unwrap().is_none());

        let mut huge = b"ply\n".to_vec();
        huge.resize(PLY_HEADER_WINDOW + 10, b' ');
        assert!(PlyHeader::parse(&huge).is_err());
        assert!(detect_ply_format(b"ply\nformat binary_little_endian 1.0\n").is_err());
    }

    #[test]
    fn test_header_layout() {
        let bytes = PlyBuilder::new()
            .element("vertex", 2, &[("float", "x"), ("uchar", "red"), ("double", "y")])
            .build();
        let header = PlyHeader::parse(&bytes).unwrap().unwrap();
        assert_eq!(header.header_size, bytes.len());
        let vertex = header.element("vertex").unwrap();
        assert_eq!(vertex.record_size, 13);
        assert_eq!(vertex.require("y").unwrap().offset, 5);
        assert!(vertex.require("z").is_err());
        assert_eq!(detect_ply_format(&[bytes.clone(), vec![0; 200]].concat()).unwrap(), PlyFormat::Generic);
    }
}
