use anyhow::anyhow;

use super::{sigmoid, to_color_byte, PlyElement, PlyHeader, PlyProperty, SH_C0};
use crate::uncompressed::{normalize_rotation, sh_count_for_degree, SplatRecord, MAX_SH_DEGREE};

const REST_PAGES: usize = 15;

/// Lookup tables shared by every splat of a codebook-compressed PLY. Page
/// values are already transformed: `opacity` and `features_dc` hold 0..255
/// bytes, `scaling` holds linear scales.
#[derive(Debug, Clone, Default)]
pub struct CodeBook {
    pub features_dc: Vec<f32>,
    pub features_rest: Vec<Vec<f32>>,
    pub opacity: Vec<f32>,
    pub scaling: Vec<f32>,
    pub rotation_re: Vec<f32>,
    pub rotation_im: Vec<f32>,
}

impl CodeBook {
    fn finalize(&mut self) {
        for v in self.opacity.iter_mut() {
            *v = to_color_byte(sigmoid(*v));
        }
        for v in self.features_dc.iter_mut() {
            *v = to_color_byte(0.5 + SH_C0 * *v);
        }
        for v in self.scaling.iter_mut() {
            *v = v.exp();
        }
    }
}

struct CodeBookLayout {
    features_dc: PlyProperty,
    features_rest: Vec<PlyProperty>,
    opacity: PlyProperty,
    scaling: PlyProperty,
    rotation_re: PlyProperty,
    rotation_im: PlyProperty,
}

/// Vertex fields are page indices except for the position.
struct CodebookVertexLayout {
    xyz: [PlyProperty; 3],
    scale: Option<[PlyProperty; 3]>,
    f_dc: Option<[PlyProperty; 3]>,
    opacity: Option<PlyProperty>,
    rot: [PlyProperty; 4],
    /// Interleaved `[k * 3 + c]`, each an index into rest page `k`.
    sh: Vec<PlyProperty>,
}

pub(super) struct CodebookState {
    codebook_layout: CodeBookLayout,
    vertex: CodebookVertexLayout,
    codebook: CodeBook,
    finalized: bool,
    sh_degree: usize,
}

fn group<const N: usize>(element: &PlyElement, names: [&str; N]) -> Option<[PlyProperty; N]> {
    let props = names.map(|name| element.get(name));
    if props.iter().all(|p| p.is_some()) {
        Some(props.map(|p| p.unwrap()))
    } else {
        None
    }
}

impl CodebookState {
    pub(super) fn new(header: &PlyHeader, max_sh_degree: usize) -> anyhow::Result<Self> {
        let centers = header
            .element("codebook_centers")
            .ok_or_else(|| anyhow!("Missing codebook_centers element"))?;
        let vertex = header.element("vertex").ok_or_else(|| anyhow!("Missing vertex element"))?;
        let vertex_position = header.elements.iter().position(|e| e.name == "vertex");
        let codebook_position = header.elements.iter().position(|e| e.name == "codebook_centers");
        if codebook_position > vertex_position {
            return Err(anyhow!("codebook_centers element must precede vertex element"));
        }

        let rest_pages = centers.count_indexed("features_rest_").min(REST_PAGES);
        let codebook_layout = CodeBookLayout {
            features_dc: centers.require("features_dc")?,
            features_rest: (0..rest_pages)
                .map(|k| centers.require(&format!("features_rest_{}", k)))
                .collect::<anyhow::Result<_>>()?,
            opacity: centers.require("opacity")?,
            scaling: centers.require("scaling")?,
            rotation_re: centers.require("rotation_re")?,
            rotation_im: centers.require("rotation_im")?,
        };

        let rest_fields = vertex.count_indexed("f_rest_");
        let coefficients = (rest_fields / 3).min(rest_pages);
        let sh_degree = match coefficients {
            n if n >= 8 => 2,
            n if n >= 3 => 1,
            _ => 0,
        }
        .min(max_sh_degree)
        .min(MAX_SH_DEGREE);
        let sh = (0..sh_count_for_degree(sh_degree))
            .map(|i| vertex.require(&format!("f_rest_{}", i)))
            .collect::<anyhow::Result<_>>()?;

        let vertex_layout = CodebookVertexLayout {
            xyz: [vertex.require("x")?, vertex.require("y")?, vertex.require("z")?],
            scale: group(vertex, ["scale_0", "scale_1", "scale_2"]),
            f_dc: group(vertex, ["f_dc_0", "f_dc_1", "f_dc_2"]),
            opacity: vertex.get("opacity"),
            rot: [
                vertex.require("rot_0")?,
                vertex.require("rot_1")?,
                vertex.require("rot_2")?,
                vertex.require("rot_3")?,
            ],
            sh,
        };

        Ok(Self {
            codebook: CodeBook {
                features_rest: vec![Vec::new(); rest_pages],
                ..Default::default()
            },
            codebook_layout,
            vertex: vertex_layout,
            finalized: false,
            sh_degree,
        })
    }

    pub(super) fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub(super) fn add_codebook_rows(&mut self, element: &PlyElement, data: &[u8], count: usize) {
        let layout = &self.codebook_layout;
        let book = &mut self.codebook;
        for i in 0..count {
            let base = i * element.record_size;
            book.features_dc.push(layout.features_dc.get_f32(data, base));
            for (page, prop) in book.features_rest.iter_mut().zip(&layout.features_rest) {
                page.push(prop.get_f32(data, base));
            }
            book.opacity.push(layout.opacity.get_f32(data, base));
            book.scaling.push(layout.scaling.get_f32(data, base));
            book.rotation_re.push(layout.rotation_re.get_f32(data, base));
            book.rotation_im.push(layout.rotation_im.get_f32(data, base));
        }
    }

    pub(super) fn finish_codebook(&mut self) -> anyhow::Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.codebook.features_dc.is_empty() {
            return Err(anyhow!("PLY codebook is empty"));
        }
        self.codebook.finalize();
        self.finalized = true;
        log::debug!("PLY codebook with {} entries", self.codebook.features_dc.len());
        Ok(())
    }

    pub(super) fn decode_vertex(&self, data: &[u8], base: usize) -> anyhow::Result<SplatRecord> {
        let book = &self.codebook;
        let layout = &self.vertex;
        let lookup = |page: &[f32], prop: PlyProperty| -> anyhow::Result<f32> {
            let index = prop.get_index(data, base);
            page.get(index)
                .copied()
                .ok_or_else(|| anyhow!("Codebook index {} out of range", index))
        };

        let mut splat = SplatRecord::new(self.sh_degree);
        splat.set_center(layout.xyz.map(|p| p.get_f32(data, base)).into());

        let mut scale = [0.01; 3];
        if let Some(props) = layout.scale {
            for (dest, prop) in scale.iter_mut().zip(props) {
                *dest = lookup(&book.scaling, prop)?;
            }
        }
        splat.set_scale(scale.into());

        let mut color = [0.0; 3];
        if let Some(props) = layout.f_dc {
            for (dest, prop) in color.iter_mut().zip(props) {
                *dest = lookup(&book.features_dc, prop)?;
            }
        }
        splat.set_color(color);

        if let Some(prop) = layout.opacity {
            splat.set_opacity(lookup(&book.opacity, prop)?);
        } else {
            splat.set_opacity(255.0);
        }

        let rotation = [
            lookup(&book.rotation_re, layout.rot[0])?,
            lookup(&book.rotation_im, layout.rot[1])?,
            lookup(&book.rotation_im, layout.rot[2])?,
            lookup(&book.rotation_im, layout.rot[3])?,
        ];
        splat.set_rotation(normalize_rotation(rotation));

        for (i, prop) in layout.sh.iter().enumerate() {
            let value = lookup(&book.features_rest[i / 3], *prop)?;
            splat.sh_mut()[i] = value;
        }
        Ok(splat)
    }
}

#[cfg(test)]
mod tests {
    use super::CodeBook;
    use crate::ply::tests::PlyBuilder;
    use crate::ply::{parse_ply, PlyHeader, SH_C0};

    fn build_codebook_ply() -> Vec<u8> {
        let mut codebook_props = vec![("half", "features_dc".to_string())];
        for k in 0..3 {
            codebook_props.push(("half", format!("features_rest_{}", k)));
        }
        for name in ["opacity", "scaling", "rotation_re", "rotation_im"] {
            codebook_props.push(("half", name.to_string()));
        }
        let codebook_props: Vec<(&str, &str)> = codebook_props.iter().map(|(t, n)| (*t, n.as_str())).collect();

        let mut vertex_props = vec![("half", "x".to_string()), ("half", "y".to_string()), ("half", "z".to_string())];
        for name in ["scale_0", "scale_1", "scale_2", "f_dc_0", "f_dc_1", "f_dc_2", "opacity", "rot_0", "rot_1", "rot_2", "rot_3"] {
            vertex_props.push(("uchar", name.to_string()));
        }
        for i in 0..9 {
            vertex_props.push(("uchar", format!("f_rest_{}", i)));
        }
        let vertex_props: Vec<(&str, &str)> = vertex_props.iter().map(|(t, n)| (*t, n.as_str())).collect();

        let mut builder = PlyBuilder::new()
            .element("codebook_centers", 2, &codebook_props)
            .element("vertex", 1, &vertex_props);
        // entry 0, entry 1: dc, rest0..2, opacity, scaling, re, im
        for entry in [[0.0, 0.1, 0.2, 0.3, 0.0, 0.0, 1.0, 0.0], [1.0, -0.1, -0.2, -0.3, 10.0, 1.0, 0.0, 1.0]] {
            for v in entry {
                builder = builder.f16(v);
            }
        }
        builder = builder.f16(1.0).f16(2.0).f16(3.0);
        // scale, dc, opacity, rot
        for index in [0u8, 1, 0, 1, 0, 1, 1, 0, 0, 0, 0] {
            builder = builder.u8(index);
        }
        // rest: coefficient k uses page k
        for index in [0u8, 1, 0, 1, 1, 1, 0, 0, 0] {
            builder = builder.u8(index);
        }
        builder.build()
    }

    #[test]
    fn test_codebook_decode() {
        let bytes = build_codebook_ply();
        let header = PlyHeader::parse(&bytes).unwrap().unwrap();
        assert_eq!(header.format, crate::ply::PlyFormat::Codebook);

        let splats = parse_ply(&bytes, 2).unwrap();
        let s = splats.get(0);
        assert_eq!(s.center().to_array(), [1.0, 2.0, 3.0]);
        assert!((s.scale().x - 1.0).abs() < 1e-6);
        assert!((s.scale().y - 1.0f32.exp()).abs() < 1e-2);
        assert_eq!(s.color()[0], (255.0 * (0.5 + SH_C0)).floor());
        assert_eq!(s.color()[1], 127.0);
        assert_eq!(s.opacity(), 254.0);
        assert_eq!(s.rotation(), [1.0, 0.0, 0.0, 0.0]);
        assert!((s.sh()[0] - 0.1).abs() < 1e-3);
        assert!((s.sh()[1] + 0.1).abs() < 1e-3);
        assert!((s.sh()[3] + 0.2).abs() < 1e-3);
        assert!((s.sh()[6] - 0.3).abs() < 1e-3);
        assert!(s.sh()[9..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_pages_floor_like_generic_layout() {
        let mut book = CodeBook {
            features_dc: vec![0.0, 1.0, -10.0],
            opacity: vec![0.0, 10.0, -20.0],
            ..Default::default()
        };
        book.finalize();
        // 127.5 and 254.99 truncate.
        assert_eq!(book.features_dc, vec![127.0, 199.0, 0.0]);
        assert_eq!(book.opacity, vec![127.0, 254.0, 0.0]);
    }
}
