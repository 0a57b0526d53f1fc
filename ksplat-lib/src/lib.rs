pub mod bucket;
pub mod decoder;
pub mod dot_splat;
pub mod load;
pub mod ply;
pub mod scalar;
pub mod sort;
pub mod splat_buffer;
pub mod uncompressed;
