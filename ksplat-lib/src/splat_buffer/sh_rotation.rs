use glam::{Mat3, Mat4};

const SQRT_1_4: f32 = 0.5;
const SQRT_3_4: f32 = 0.866_025_4;
const SQRT_1_3: f32 = 0.577_350_26;
const SQRT_4_3: f32 = 1.154_700_5;
const SQRT_1_12: f32 = 0.288_675_13;

/// Coefficient rotation matrices for real SH bands 1 and 2, in the
/// coefficient order the splat formats use. Apply to one color channel at a
/// time: `out[k] = sum_j m[k][j] * in[j]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShRotation {
    pub band1: [[f32; 3]; 3],
    pub band2: [[f32; 5]; 5],
}

impl ShRotation {
    pub fn identity() -> Self {
        Self::from_mat3(Mat3::IDENTITY)
    }

    /// Rotation part of an affine transform. Scale is divided out first.
    pub fn from_transform(transform: &Mat4) -> Self {
        let (_, rotation, _) = transform.to_scale_rotation_translation();
        Self::from_mat3(Mat3::from_quat(rotation.normalize()))
    }

    pub fn from_mat3(m: Mat3) -> Self {
        // r[a][b] is row a, column b.
        let r: [[f32; 3]; 3] = std::array::from_fn(|a| std::array::from_fn(|b| m.col(b)[a]));

        let band1 = [
            [r[1][1], -r[1][2], r[1][0]],
            [-r[2][1], r[2][2], -r[2][0]],
            [r[0][1], -r[0][2], r[0][0]],
        ];

        // Band 2 entries are products of band 1 entries.
        let s = &band1;
        let band2 = [
            [
                SQRT_1_4 * ((s[2][2] * s[0][0] + s[2][0] * s[0][2]) + (s[0][2] * s[2][0] + s[0][0] * s[2][2])),
                s[2][1] * s[0][0] + s[0][1] * s[2][0],
                SQRT_3_4 * (s[2][1] * s[0][1] + s[0][1] * s[2][1]),
                s[2][1] * s[0][2] + s[0][1] * s[2][2],
                SQRT_1_4 * ((s[2][2] * s[0][2] - s[2][0] * s[0][0]) + (s[0][2] * s[2][2] - s[0][0] * s[2][0])),
            ],
            [
                SQRT_1_4 * ((s[1][2] * s[0][0] + s[1][0] * s[0][2]) + (s[0][2] * s[1][0] + s[0][0] * s[1][2])),
                s[1][1] * s[0][0] + s[0][1] * s[1][0],
                SQRT_3_4 * (s[1][1] * s[0][1] + s[0][1] * s[1][1]),
                s[1][1] * s[0][2] + s[0][1] * s[1][2],
                SQRT_1_4 * ((s[1][2] * s[0][2] - s[1][0] * s[0][0]) + (s[0][2] * s[1][2] - s[0][0] * s[1][0])),
            ],
            [
                SQRT_1_3 * (s[1][2] * s[1][0] + s[1][0] * s[1][2]) - SQRT_1_12 * ((s[2][2] * s[2][0] + s[2][0] * s[2][2]) + (s[0][2] * s[0][0] + s[0][0] * s[0][2])),
                SQRT_4_3 * s[1][1] * s[1][0] - SQRT_1_3 * (s[2][1] * s[2][0] + s[0][1] * s[0][0]),
                s[1][1] * s[1][1] - SQRT_1_4 * (s[2][1] * s[2][1] + s[0][1] * s[0][1]),
                SQRT_4_3 * s[1][1] * s[1][2] - SQRT_1_3 * (s[2][1] * s[2][2] + s[0][1] * s[0][2]),
                SQRT_1_3 * (s[1][2] * s[1][2] - s[1][0] * s[1][0]) - SQRT_1_12 * ((s[2][2] * s[2][2] - s[2][0] * s[2][0]) + (s[0][2] * s[0][2] - s[0][0] * s[0][0])),
            ],
            [
                SQRT_1_4 * ((s[1][2] * s[2][0] + s[1][0] * s[2][2]) + (s[2][2] * s[1][0] + s[2][0] * s[1][2])),
                s[1][1] * s[2][0] + s[2][1] * s[1][0],
                SQRT_3_4 * (s[1][1] * s[2][1] + s[2][1] * s[1][1]),
                s[1][1] * s[2][2] + s[2][1] * s[1][2],
                SQRT_1_4 * ((s[1][2] * s[2][2] - s[1][0] * s[2][0]) + (s[2][2] * s[1][2] - s[2][0] * s[1][0])),
            ],
            [
                SQRT_1_4 * ((s[2][2] * s[2][0] + s[2][0] * s[2][2]) - (s[0][2] * s[0][0] + s[0][0] * s[0][2])),
                s[2][1] * s[2][0] - s[0][1] * s[0][0],
                SQRT_3_4 * (s[2][1] * s[2][1] - s[0][1] * s[0][1]),
                s[2][1] * s[2][2] - s[0][1] * s[0][2],
                SQRT_1_4 * ((s[2][2] * s[2][2] - s[2][0] * s[2][0]) - (s[0][2] * s[0][2] - s[0][0] * s[0][0])),
            ],
        ];

        Self { band1, band2 }
    }

    /// Rotate interleaved RGB coefficients (`sh[k * 3 + c]`) in place.
    /// `sh.len()` decides which bands are present.
    pub fn apply(&self, sh: &mut [f32]) {
        if sh.len() >= 9 {
            let (band1, rest) = sh.split_at_mut(9);
            rotate_band(&self.band1, band1);
            if rest.len() >= 15 {
                rotate_band(&self.band2, &mut rest[..15]);
            }
        }
    }
}

fn rotate_band<const N: usize>(matrix: &[[f32; N]; N], sh: &mut [f32]) {
    for c in 0..3 {
        let input: [f32; N] = std::array::from_fn(|j| sh[j * 3 + c]);
        for (k, row) in matrix.iter().enumerate() {
            sh[k * 3 + c] = row.iter().zip(&input).map(|(m, v)| m * v).sum();
        }
    }
}
