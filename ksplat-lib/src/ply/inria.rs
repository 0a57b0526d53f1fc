use anyhow::anyhow;

use super::{sigmoid, to_color_byte, PlyElement, PlyProperty, SH_C0};
use crate::uncompressed::{normalize_rotation, sh_count_for_degree, SplatRecord, MAX_SH_DEGREE};

const DEFAULT_SCALE: f32 = 0.01;

/// Degree implied by the number of `f_rest_*` fields (3 channels).
pub(super) fn sh_degree_for_rest_count(count: usize) -> usize {
    match count / 3 {
        n if n >= 15 => 3,
        n if n >= 8 => 2,
        n if n >= 3 => 1,
        _ => 0,
    }
}

enum ColorSource {
    Dc([PlyProperty; 3]),
    Rgb([PlyProperty; 3]),
    None,
}

/// Resolved field offsets for the generic per-splat layout.
pub(super) struct InriaLayout {
    xyz: [PlyProperty; 3],
    scale: Option<[PlyProperty; 3]>,
    rot: Option<[PlyProperty; 4]>,
    color: ColorSource,
    opacity: Option<PlyProperty>,
    /// Per channel then per coefficient, indexed `[k * 3 + c]`.
    sh: Vec<PlyProperty>,
    sh_degree: usize,
}

fn optional<const N: usize>(element: &PlyElement, names: [&str; N]) -> anyhow::Result<Option<[PlyProperty; N]>> {
    let props = names.map(|name| element.get(name));
    match props.iter().filter(|p| p.is_some()).count() {
        0 => Ok(None),
        n if n == N => Ok(Some(props.map(|p| p.unwrap()))),
        _ => Err(anyhow!("Incomplete property group {:?} in PLY element {}", names, element.name)),
    }
}

impl InriaLayout {
    pub(super) fn new(vertex: &PlyElement, max_sh_degree: usize) -> anyhow::Result<Self> {
        let xyz = [vertex.require("x")?, vertex.require("y")?, vertex.require("z")?];
        let scale = optional(vertex, ["scale_0", "scale_1", "scale_2"])?;
        let rot = optional(vertex, ["rot_0", "rot_1", "rot_2", "rot_3"])?;
        let color = if let Some(dc) = optional(vertex, ["f_dc_0", "f_dc_1", "f_dc_2"])? {
            ColorSource::Dc(dc)
        } else if let Some(rgb) = optional(vertex, ["red", "green", "blue"])? {
            ColorSource::Rgb(rgb)
        } else {
            ColorSource::None
        };

        let rest_count = vertex.count_indexed("f_rest_");
        let sh_degree = sh_degree_for_rest_count(rest_count).min(max_sh_degree).min(MAX_SH_DEGREE);
        let stride = rest_count / 3;
        let coefficients = sh_count_for_degree(sh_degree) / 3;
        let mut sh = Vec::with_capacity(coefficients * 3);
        for k in 0..coefficients {
            for c in 0..3 {
                sh.push(vertex.require(&format!("f_rest_{}", k + c * stride))?);
            }
        }

        Ok(Self {
            xyz,
            scale,
            rot,
            color,
            opacity: vertex.get("opacity"),
            sh,
            sh_degree,
        })
    }

    pub(super) fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub(super) fn decode(&self, data: &[u8], base: usize) -> SplatRecord {
        let mut splat = SplatRecord::new(self.sh_degree);
        let center = self.xyz.map(|p| p.get_f32(data, base));
        splat.set_center(center.into());

        let scale = match self.scale {
            Some(scale) => scale.map(|p| p.get_f32(data, base).exp()),
            None => [DEFAULT_SCALE; 3],
        };
        splat.set_scale(scale.into());

        if let Some(rot) = self.rot {
            splat.set_rotation(normalize_rotation(rot.map(|p| p.get_f32(data, base))));
        }

        let color = match &self.color {
            ColorSource::Dc(dc) => dc.map(|p| to_color_byte(0.5 + SH_C0 * p.get_f32(data, base))),
            ColorSource::Rgb(rgb) => rgb.map(|p| {
                let v = p.get_f32(data, base);
                if p.ty.is_float() {
                    to_color_byte(v)
                } else {
                    v.clamp(0.0, 255.0)
                }
            }),
            ColorSource::None => [0.0; 3],
        };
        splat.set_color(color);

        let opacity = match self.opacity {
            Some(p) => to_color_byte(sigmoid(p.get_f32(data, base))),
            None => 255.0,
        };
        splat.set_opacity(opacity);

        for (dest, p) in splat.sh_mut().iter_mut().zip(&self.sh) {
            *dest = p.get_f32(data, base);
        }
        splat
    }
}

#[cfg(test)]
mod tests {
    use crate::ply::tests::PlyBuilder;
    use crate::ply::{parse_ply, parse_rows, PlyDecoder};
    use crate::decoder::ChunkReceiver;
    use crate::uncompressed::UncompressedSplatArray;

    const FULL_PROPS: [(&str, &str); 14] = [
        ("float", "x"),
        ("float", "y"),
        ("float", "z"),
        ("float", "scale_0"),
        ("float", "scale_1"),
        ("float", "scale_2"),
        ("float", "rot_0"),
        ("float", "rot_1"),
        ("float", "rot_2"),
        ("float", "rot_3"),
        ("float", "f_dc_0"),
        ("float", "f_dc_1"),
        ("float", "f_dc_2"),
        ("float", "opacity"),
    ];

    fn push_row(builder: PlyBuilder, i: f32) -> PlyBuilder {
        builder
            .f32(i)
            .f32(2.0 * i)
            .f32(-i)
            .f32(0.0)
            .f32(1.0f32.ln())
            .f32(-1.0)
            .f32(2.0)
            .f32(0.0)
            .f32(0.0)
            .f32(0.0)
            .f32(0.0)
            .f32(1.0)
            .f32(-10.0)
            .f32(0.0)
    }

    fn build(rows: usize) -> Vec<u8> {
        let mut builder = PlyBuilder::new().element("vertex", rows, &FULL_PROPS);
        for i in 0..rows {
            builder = push_row(builder, i as f32);
        }
        builder.build()
    }

    #[test]
    fn test_generic_fields() {
        let splats = parse_ply(&build(2), 2).unwrap();
        assert_eq!(splats.splat_count(), 2);
        assert_eq!(splats.sh_degree(), 2);
        let s = splats.get(1);
        assert_eq!(s.center().to_array(), [1.0, 2.0, -1.0]);
        assert!((s.scale().x - 1.0).abs() < 1e-6);
        assert!((s.scale().z - (-1.0f32).exp()).abs() < 1e-6);
        assert_eq!(s.rotation(), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(s.color()[0], 127.0);
        assert_eq!(s.color()[1], ((0.5 + super::SH_C0) * 255.0).floor());
        assert_eq!(s.color()[2], 0.0);
        assert_eq!(s.opacity(), 127.0);
        assert!(s.sh().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rgb_fallback_and_defaults() {
        let bytes = PlyBuilder::new()
            .element("vertex", 1, &[("float", "x"), ("float", "y"), ("float", "z"), ("uchar", "red"), ("uchar", "green"), ("uchar", "blue")])
            .f32(1.0)
            .f32(2.0)
            .f32(3.0)
            .u8(10)
            .u8(20)
            .u8(30)
            .build();
        let splats = parse_ply(&bytes, 0).unwrap();
        let s = splats.get(0);
        assert_eq!(s.color(), [10.0, 20.0, 30.0]);
        assert_eq!(s.scale().to_array(), [0.01; 3]);
        assert_eq!(s.opacity(), 255.0);
    }

    #[test]
    fn test_missing_position_fails() {
        let bytes = PlyBuilder::new().element("vertex", 1, &[("float", "x")]).f32(1.0).build();
        assert!(parse_ply(&bytes, 0).is_err());
    }

    #[test]
    fn test_sh_reordered_to_interleaved() {
        let mut props: Vec<(&str, String)> = ["x", "y", "z"].iter().map(|n| ("float", n.to_string())).collect();
        for i in 0..45 {
            props.push(("float", format!("f_rest_{}", i)));
        }
        let props: Vec<(&str, &str)> = props.iter().map(|(t, n)| (*t, n.as_str())).collect();
        let mut builder = PlyBuilder::new().element("vertex", 1, &props).f32(0.0).f32(0.0).f32(0.0);
        for i in 0..45 {
            builder = builder.f32(i as f32);
        }
        let splats = parse_ply(&builder.build(), 2).unwrap();
        let sh = splats.get(0).sh();
        assert_eq!(sh.len(), 24);
        // channel-major source with stride 15
        assert_eq!(&sh[0..6], &[0.0, 15.0, 30.0, 1.0, 16.0, 31.0]);
        assert_eq!(&sh[9..12], &[3.0, 18.0, 33.0]);

        let empty = parse_ply(&PlyBuilder::new().build(), 1);
        assert!(empty.is_err());
    }

    #[test]
    fn test_row_range_and_streaming() {
        let bytes = build(10);
        let whole = parse_ply(&bytes, 2).unwrap();

        let part = parse_rows(&bytes, 3..7, UncompressedSplatArray::new(2)).unwrap();
        assert_eq!(part.splat_count(), 4);
        assert_eq!(part.get(0), whole.get(3));
        assert_eq!(part.get(3), whole.get(6));

        let mut decoder = PlyDecoder::new(UncompressedSplatArray::new(2));
        for chunk in bytes.chunks(13) {
            decoder.push(chunk).unwrap();
        }
        decoder.finish().unwrap();
        assert_eq!(decoder.into_splats().splats(), whole.splats());
    }

    #[test]
    fn test_truncated_stream_fails() {
        let bytes = build(3);
        let mut decoder = PlyDecoder::new(UncompressedSplatArray::new(0));
        decoder.push(&bytes[..bytes.len() - 5]).unwrap();
        assert!(decoder.finish().is_err());
    }
}
