use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::scalar::{CompressionLevel, DEFAULT_8BIT_HALF_RANGE};
use crate::uncompressed::sh_count_for_degree;

pub const HEADER_SIZE_BYTES: usize = 4096;
pub const SECTION_HEADER_SIZE_BYTES: usize = 1024;

pub const CURRENT_MAJOR_VERSION: u8 = 0;
pub const CURRENT_MINOR_VERSION: u8 = 1;
const MIN_SUPPORTED_MAJOR_VERSION: u8 = 0;
const MIN_SUPPORTED_MINOR_VERSION: u8 = 1;

pub const BUCKET_STORAGE_SIZE_BYTES: u16 = 12;
pub const PARTIAL_BUCKET_LENGTH_BYTES: usize = 4;

/// Per-level record layout. Offsets are from the start of a splat record.
#[derive(Debug, Clone, Copy)]
pub struct CompressionLayout {
    pub bytes_per_center: usize,
    pub bytes_per_scale: usize,
    pub bytes_per_rotation: usize,
    pub bytes_per_color: usize,
    pub bytes_per_sh_component: usize,
    pub scale_offset: usize,
    pub rotation_offset: usize,
    pub color_offset: usize,
    pub sh_offset: usize,
    pub scale_range: u32,
    /// Record size by SH degree 0, 1, 2.
    pub bytes_per_splat: [usize; 3],
}

const LAYOUTS: [CompressionLayout; 3] = [
    CompressionLayout {
        bytes_per_center: 12,
        bytes_per_scale: 12,
        bytes_per_rotation: 16,
        bytes_per_color: 4,
        bytes_per_sh_component: 4,
        scale_offset: 12,
        rotation_offset: 24,
        color_offset: 40,
        sh_offset: 44,
        scale_range: 1,
        bytes_per_splat: [44, 80, 140],
    },
    CompressionLayout {
        bytes_per_center: 6,
        bytes_per_scale: 6,
        bytes_per_rotation: 8,
        bytes_per_color: 4,
        bytes_per_sh_component: 2,
        scale_offset: 6,
        rotation_offset: 12,
        color_offset: 20,
        sh_offset: 24,
        scale_range: 32767,
        bytes_per_splat: [24, 42, 72],
    },
    CompressionLayout {
        bytes_per_center: 6,
        bytes_per_scale: 6,
        bytes_per_rotation: 8,
        bytes_per_color: 4,
        bytes_per_sh_component: 1,
        scale_offset: 6,
        rotation_offset: 12,
        color_offset: 20,
        sh_offset: 24,
        scale_range: 32767,
        bytes_per_splat: [24, 33, 48],
    },
];

pub fn compression_layout(level: CompressionLevel) -> &'static CompressionLayout {
    &LAYOUTS[level as usize]
}

pub fn bytes_per_splat(level: CompressionLevel, sh_degree: usize) -> usize {
    compression_layout(level).bytes_per_splat[sh_degree.min(2)]
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn write_bytes(out: &mut [u8], offset: usize, bytes: &[u8]) {
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplatBufferHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub max_section_count: u32,
    pub section_count: u32,
    pub max_splat_count: u32,
    pub splat_count: u32,
    pub compression_level: CompressionLevel,
    pub scene_center: [f32; 3],
    pub min_sh_coeff: f32,
    pub max_sh_coeff: f32,
}

impl Default for SplatBufferHeader {
    fn default() -> Self {
        Self {
            version_major: CURRENT_MAJOR_VERSION,
            version_minor: CURRENT_MINOR_VERSION,
            max_section_count: 0,
            section_count: 0,
            max_splat_count: 0,
            splat_count: 0,
            compression_level: CompressionLevel::Full,
            scene_center: [0.0; 3],
            min_sh_coeff: -DEFAULT_8BIT_HALF_RANGE,
            max_sh_coeff: DEFAULT_8BIT_HALF_RANGE,
        }
    }
}

pub fn check_version(major: u8, minor: u8) -> anyhow::Result<()> {
    let supported = major > MIN_SUPPORTED_MAJOR_VERSION
        || (major == MIN_SUPPORTED_MAJOR_VERSION && minor >= MIN_SUPPORTED_MINOR_VERSION);
    if !supported {
        return Err(anyhow!(
            "Unsupported splat buffer version {}.{}, need at least {}.{}",
            major,
            minor,
            MIN_SUPPORTED_MAJOR_VERSION,
            MIN_SUPPORTED_MINOR_VERSION
        ));
    }
    Ok(())
}

impl SplatBufferHeader {
    pub fn read(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < HEADER_SIZE_BYTES {
            return Err(anyhow!("Splat buffer header truncated: {} bytes", bytes.len()));
        }
        let (version_major, version_minor) = (bytes[0], bytes[1]);
        check_version(version_major, version_minor)?;

        let min_sh_coeff = read_f32(bytes, 36);
        let max_sh_coeff = read_f32(bytes, 40);
        Ok(Self {
            version_major,
            version_minor,
            max_section_count: read_u32(bytes, 4),
            section_count: read_u32(bytes, 8),
            max_splat_count: read_u32(bytes, 12),
            splat_count: read_u32(bytes, 16),
            compression_level: CompressionLevel::try_from(read_u16(bytes, 20))?,
            scene_center: [read_f32(bytes, 24), read_f32(bytes, 28), read_f32(bytes, 32)],
            // A zero range means the writer left the defaults.
            min_sh_coeff: if min_sh_coeff == 0.0 { -DEFAULT_8BIT_HALF_RANGE } else { min_sh_coeff },
            max_sh_coeff: if max_sh_coeff == 0.0 { DEFAULT_8BIT_HALF_RANGE } else { max_sh_coeff },
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[..HEADER_SIZE_BYTES].fill(0);
        out[0] = self.version_major;
        out[1] = self.version_minor;
        write_bytes(out, 4, &self.max_section_count.to_le_bytes());
        write_bytes(out, 8, &self.section_count.to_le_bytes());
        write_bytes(out, 12, &self.max_splat_count.to_le_bytes());
        write_bytes(out, 16, &self.splat_count.to_le_bytes());
        write_bytes(out, 20, &self.compression_level.as_u16().to_le_bytes());
        for (i, v) in self.scene_center.iter().enumerate() {
            write_bytes(out, 24 + i * 4, &v.to_le_bytes());
        }
        write_bytes(out, 36, &self.min_sh_coeff.to_le_bytes());
        write_bytes(out, 40, &self.max_sh_coeff.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionHeader {
    pub splat_count: u32,
    pub max_splat_count: u32,
    pub bucket_size: u32,
    pub bucket_count: u32,
    pub bucket_block_size: f32,
    pub bucket_storage_size_bytes: u16,
    pub compression_scale_range: u32,
    pub storage_size_bytes: u32,
    pub full_bucket_count: u32,
    pub partially_filled_bucket_count: u32,
    pub sh_degree: u16,
}

impl SectionHeader {
    pub fn read(bytes: &[u8], level: CompressionLevel) -> anyhow::Result<Self> {
        if bytes.len() < SECTION_HEADER_SIZE_BYTES {
            return Err(anyhow!("Section header truncated: {} bytes", bytes.len()));
        }
        let sh_degree = read_u16(bytes, 40);
        if sh_degree > 2 {
            return Err(anyhow!("Unsupported section SH degree: {}", sh_degree));
        }
        let compression_scale_range = match read_u32(bytes, 24) {
            0 => compression_layout(level).scale_range,
            range => range,
        };
        Ok(Self {
            splat_count: read_u32(bytes, 0),
            max_splat_count: read_u32(bytes, 4),
            bucket_size: read_u32(bytes, 8),
            bucket_count: read_u32(bytes, 12),
            bucket_block_size: read_f32(bytes, 16),
            bucket_storage_size_bytes: read_u16(bytes, 20),
            compression_scale_range,
            storage_size_bytes: read_u32(bytes, 28),
            full_bucket_count: read_u32(bytes, 32),
            partially_filled_bucket_count: read_u32(bytes, 36),
            sh_degree,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[..SECTION_HEADER_SIZE_BYTES].fill(0);
        write_bytes(out, 0, &self.splat_count.to_le_bytes());
        write_bytes(out, 4, &self.max_splat_count.to_le_bytes());
        write_bytes(out, 8, &self.bucket_size.to_le_bytes());
        write_bytes(out, 12, &self.bucket_count.to_le_bytes());
        write_bytes(out, 16, &self.bucket_block_size.to_le_bytes());
        write_bytes(out, 20, &self.bucket_storage_size_bytes.to_le_bytes());
        write_bytes(out, 24, &self.compression_scale_range.to_le_bytes());
        write_bytes(out, 28, &self.storage_size_bytes.to_le_bytes());
        write_bytes(out, 32, &self.full_bucket_count.to_le_bytes());
        write_bytes(out, 36, &self.partially_filled_bucket_count.to_le_bytes());
        write_bytes(out, 40, &self.sh_degree.to_le_bytes());
    }

    pub fn sh_degree(&self) -> usize {
        self.sh_degree as usize
    }

    /// Bytes of bucket metadata preceding the splat records.
    pub fn buckets_storage_size_bytes(&self) -> usize {
        self.bucket_storage_size_bytes as usize * self.bucket_count as usize
            + self.partially_filled_bucket_count as usize * PARTIAL_BUCKET_LENGTH_BYTES
    }

    pub fn splat_data_size_bytes(&self, level: CompressionLevel) -> usize {
        bytes_per_splat(level, self.sh_degree()) * self.max_splat_count as usize
    }

    /// Storage the header implies, used to validate `storage_size_bytes`.
    pub fn computed_storage_size_bytes(&self, level: CompressionLevel) -> usize {
        self.buckets_storage_size_bytes() + self.splat_data_size_bytes(level)
    }

    pub fn half_bucket_block_size(&self) -> f32 {
        self.bucket_block_size / 2.0
    }

    /// World units per quantization step of a center offset.
    pub fn compression_scale_factor(&self) -> f32 {
        self.half_bucket_block_size() / self.compression_scale_range as f32
    }

    pub fn sh_component_count(&self) -> usize {
        sh_count_for_degree(self.sh_degree())
    }
}
