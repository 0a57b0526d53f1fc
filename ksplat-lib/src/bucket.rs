use ahash::{HashMap, HashMapExt};
use glam::Vec3;

use crate::uncompressed::UncompressedSplatArray;

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Geometric center of the grid cell the bucket belongs to.
    pub center: Vec3,
    /// Indices into the source array.
    pub splats: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct BucketInfo {
    /// Buckets holding exactly `bucket_size` splats.
    pub full: Vec<Bucket>,
    /// Remaining buckets, one per occupied cell, ordered by cell.
    pub partial: Vec<Bucket>,
}

impl BucketInfo {
    pub fn bucket_count(&self) -> usize {
        self.full.len() + self.partial.len()
    }

    /// Full buckets first, then partial ones: the order splats are written in.
    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.full.iter().chain(self.partial.iter())
    }
}

/// Partition splats into cubic cells of `block_size` and split each cell
/// into buckets of at most `bucket_size` members.
pub fn compute_buckets(array: &UncompressedSplatArray, block_size: f32, bucket_size: usize) -> BucketInfo {
    let mut info = BucketInfo::default();
    if array.is_empty() {
        return info;
    }
    let bucket_size = bucket_size.max(1);

    let min = array.iter().map(|s| s.center()).fold(Vec3::splat(f32::INFINITY), Vec3::min);
    let half_block = block_size / 2.0;

    let mut open: HashMap<(u32, u32, u32), Bucket> = HashMap::new();
    for (index, splat) in array.iter().enumerate() {
        let cell = ((splat.center() - min) / block_size).floor();
        let key = (cell.x as u32, cell.y as u32, cell.z as u32);
        let bucket = open.entry(key).or_insert_with(|| Bucket {
            center: cell * block_size + min + Vec3::splat(half_block),
            splats: Vec::with_capacity(bucket_size),
        });
        bucket.splats.push(index as u32);
        if bucket.splats.len() >= bucket_size {
            let center = bucket.center;
            let full = std::mem::replace(
                bucket,
                Bucket { center, splats: Vec::with_capacity(bucket_size) },
            );
            info.full.push(full);
        }
    }

    let mut partial: Vec<_> = open.into_iter().filter(|(_, b)| !b.splats.is_empty()).collect();
    partial.sort_unstable_by_key(|(key, _)| *key);
    info.partial = partial.into_iter().map(|(_, b)| b).collect();

    log::debug!(
        "Bucketed {} splats: {} full, {} partial",
        array.splat_count(),
        info.full.len(),
        info.partial.len()
    );
    info
}
