use std::f32::consts::SQRT_2;

use anyhow::anyhow;

use super::inria::sh_degree_for_rest_count;
use super::{PlyElement, PlyHeader, PlyProperty};
use crate::uncompressed::{normalize_rotation, sh_count_for_degree, SplatRecord, MAX_SH_DEGREE};

pub const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct Chunk {
    min: [f32; 3],
    max: [f32; 3],
    min_scale: [f32; 3],
    max_scale: [f32; 3],
    /// Present in files that store per-chunk color extents.
    color: Option<([f32; 3], [f32; 3])>,
}

struct ChunkLayout {
    min: [PlyProperty; 3],
    max: [PlyProperty; 3],
    min_scale: [PlyProperty; 3],
    max_scale: [PlyProperty; 3],
    color: Option<([PlyProperty; 3], [PlyProperty; 3])>,
}

struct VertexLayout {
    position: PlyProperty,
    rotation: PlyProperty,
    scale: PlyProperty,
    color: PlyProperty,
}

pub(super) struct PlayCanvasState {
    chunk_layout: ChunkLayout,
    vertex: VertexLayout,
    chunks: Vec<Chunk>,
    /// Interleaved `[k * 3 + c]` over channel-major `f_rest_*` fields.
    sh: Vec<PlyProperty>,
    sh_degree: usize,
}

fn require3(element: &PlyElement, names: [&str; 3]) -> anyhow::Result<[PlyProperty; 3]> {
    Ok([element.require(names[0])?, element.require(names[1])?, element.require(names[2])?])
}

fn unpack_unorm(value: u32, bits: u32) -> f32 {
    let mask = (1u32 << bits) - 1;
    (value & mask) as f32 / mask as f32
}

fn unpack_111011(value: u32) -> [f32; 3] {
    [unpack_unorm(value >> 21, 11), unpack_unorm(value >> 11, 10), unpack_unorm(value, 11)]
}

fn unpack_8888(value: u32) -> [f32; 4] {
    [
        unpack_unorm(value >> 24, 8),
        unpack_unorm(value >> 16, 8),
        unpack_unorm(value >> 8, 8),
        unpack_unorm(value, 8),
    ]
}

/// Smallest-three encoding: the top two bits name the dropped component,
/// which is rebuilt from the unit-norm constraint. Returns `[w, x, y, z]`.
pub(crate) fn unpack_rotation(value: u32) -> [f32; 4] {
    let a = (unpack_unorm(value >> 20, 10) - 0.5) * SQRT_2;
    let b = (unpack_unorm(value >> 10, 10) - 0.5) * SQRT_2;
    let c = (unpack_unorm(value, 10) - 0.5) * SQRT_2;
    let m = (1.0 - (a * a + b * b + c * c)).max(0.0).sqrt();
    match value >> 30 {
        0 => [m, a, b, c],
        1 => [a, m, b, c],
        2 => [a, b, m, c],
        _ => [a, b, c, m],
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

impl PlayCanvasState {
    pub(super) fn new(header: &PlyHeader, max_sh_degree: usize) -> anyhow::Result<Self> {
        let chunk = header.element("chunk").ok_or_else(|| anyhow!("Missing chunk element"))?;
        let vertex = header.element("vertex").ok_or_else(|| anyhow!("Missing vertex element"))?;
        if chunk.count < vertex.count.div_ceil(CHUNK_SIZE) {
            return Err(anyhow!("Expected {} chunks, got {}", vertex.count.div_ceil(CHUNK_SIZE), chunk.count));
        }

        let color = match (
            require3(chunk, ["min_r", "min_g", "min_b"]),
            require3(chunk, ["max_r", "max_g", "max_b"]),
        ) {
            (Ok(min), Ok(max)) => Some((min, max)),
            _ => None,
        };
        let chunk_layout = ChunkLayout {
            min: require3(chunk, ["min_x", "min_y", "min_z"])?,
            max: require3(chunk, ["max_x", "max_y", "max_z"])?,
            min_scale: require3(chunk, ["min_scale_x", "min_scale_y", "min_scale_z"])?,
            max_scale: require3(chunk, ["max_scale_x", "max_scale_y", "max_scale_z"])?,
            color,
        };
        let vertex_layout = VertexLayout {
            position: vertex.require("packed_position")?,
            rotation: vertex.require("packed_rotation")?,
            scale: vertex.require("packed_scale")?,
            color: vertex.require("packed_color")?,
        };

        let (sh, sh_degree) = match header.element("sh") {
            Some(sh_element) => {
                let rest_count = sh_element.count_indexed("f_rest_");
                let degree = sh_degree_for_rest_count(rest_count).min(max_sh_degree).min(MAX_SH_DEGREE);
                let stride = rest_count / 3;
                let mut sh = Vec::new();
                for k in 0..sh_count_for_degree(degree) / 3 {
                    for c in 0..3 {
                        sh.push(sh_element.require(&format!("f_rest_{}", k + c * stride))?);
                    }
                }
                (sh, degree)
            },
            None => (Vec::new(), 0),
        };

        Ok(Self {
            chunk_layout,
            vertex: vertex_layout,
            chunks: Vec::with_capacity(chunk.count),
            sh,
            sh_degree,
        })
    }

    pub(super) fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub(super) fn add_chunks(&mut self, element: &PlyElement, data: &[u8], count: usize) {
        let layout = &self.chunk_layout;
        for i in 0..count {
            let base = i * element.record_size;
            let read = |props: [PlyProperty; 3]| props.map(|p| p.get_f32(data, base));
            self.chunks.push(Chunk {
                min: read(layout.min),
                max: read(layout.max),
                min_scale: read(layout.min_scale),
                max_scale: read(layout.max_scale),
                color: layout.color.map(|(min, max)| (read(min), read(max))),
            });
        }
    }

    pub(super) fn decode_vertex(&self, row: usize, data: &[u8], base: usize) -> anyhow::Result<SplatRecord> {
        let chunk = self
            .chunks
            .get(row / CHUNK_SIZE)
            .ok_or_else(|| anyhow!("Missing chunk for splat {}", row))?;

        let mut splat = SplatRecord::new(self.sh_degree);
        let position = unpack_111011(self.vertex.position.get_u32(data, base));
        splat.set_center(
            [
                lerp(chunk.min[0], chunk.max[0], position[0]),
                lerp(chunk.min[1], chunk.max[1], position[1]),
                lerp(chunk.min[2], chunk.max[2], position[2]),
            ]
            .into(),
        );

        let scale = unpack_111011(self.vertex.scale.get_u32(data, base));
        splat.set_scale(
            [
                lerp(chunk.min_scale[0], chunk.max_scale[0], scale[0]).exp(),
                lerp(chunk.min_scale[1], chunk.max_scale[1], scale[1]).exp(),
                lerp(chunk.min_scale[2], chunk.max_scale[2], scale[2]).exp(),
            ]
            .into(),
        );

        splat.set_rotation(normalize_rotation(unpack_rotation(self.vertex.rotation.get_u32(data, base))));

        let [r, g, b, a] = unpack_8888(self.vertex.color.get_u32(data, base));
        let mut rgb = [r, g, b];
        if let Some((min, max)) = chunk.color {
            for d in 0..3 {
                rgb[d] = lerp(min[d], max[d], rgb[d]);
            }
        }
        splat.set_color(rgb.map(super::to_color_byte));
        splat.set_opacity(super::to_color_byte(a));
        Ok(splat)
    }

    pub(super) fn decode_sh(&self, data: &[u8], base: usize, out: &mut Vec<f32>) {
        out.clear();
        out.extend(self.sh.iter().map(|p| p.get_f32(data, base) * 8.0 / 255.0 - 4.0));
    }
}
