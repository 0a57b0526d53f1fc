use glam::{Mat3, Quat, Vec3};

use crate::scalar::CompressedScalar;

/// Full 3x3 covariance `(R*S)(R*S)^T`, conjugated by `transform` when given.
pub fn covariance_matrix(scale: Vec3, rotation: Quat, transform: Option<&Mat3>) -> Mat3 {
    let m = Mat3::from_quat(rotation) * Mat3::from_diagonal(scale);
    let covariance = m * m.transpose();
    match transform {
        Some(t) => *t * covariance * t.transpose(),
        None => covariance,
    }
}

/// Write the upper triangle `[xx, xy, xz, yy, yz, zz]` to `out[offset..offset + 6]`.
pub fn compute_covariance<T: CompressedScalar>(
    scale: Vec3,
    rotation: Quat,
    transform: Option<&Mat3>,
    out: &mut [T],
    offset: usize,
) {
    let c = covariance_matrix(scale, rotation, transform);
    let upper = [c.x_axis.x, c.y_axis.x, c.z_axis.x, c.y_axis.y, c.z_axis.y, c.z_axis.z];
    for (dest, value) in out[offset..offset + 6].iter_mut().zip(upper) {
        *dest = T::from_f32(value, false, 0.0, 0.0);
    }
}
