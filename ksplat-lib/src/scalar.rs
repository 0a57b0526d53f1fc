use half::f16;
use serde::{Deserialize, Serialize};

/// Half-range used when quantizing non-SH values to 8 bits.
pub const DEFAULT_8BIT_HALF_RANGE: f32 = 1.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum CompressionLevel {
    #[default]
    Full = 0,
    Half = 1,
    Quantized = 2,
}

impl CompressionLevel {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_enum_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "0" | "full" => Ok(Self::Full),
            "1" | "half" => Ok(Self::Half),
            "2" | "quantized" => Ok(Self::Quantized),
            _ => Err(anyhow::anyhow!("Invalid compression level: {}", s)),
        }
    }
}

impl TryFrom<u16> for CompressionLevel {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> anyhow::Result<Self> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::Half),
            2 => Ok(Self::Quantized),
            _ => Err(anyhow::anyhow!("Unsupported compression level: {}", value)),
        }
    }
}

impl From<CompressionLevel> for u16 {
    fn from(level: CompressionLevel) -> u16 {
        level.as_u16()
    }
}

pub fn to_half(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

pub fn from_half(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

pub fn to_uint8(value: f32, min: f32, max: f32) -> u8 {
    let value = value.clamp(min, max);
    let scaled = ((value - min) / (max - min) * 255.0).floor();
    scaled.clamp(0.0, 255.0) as u8
}

pub fn from_uint8(value: u8, min: f32, max: f32) -> f32 {
    (value as f32 / 255.0) * (max - min) + min
}

fn quantize_range(is_sh: bool, min: f32, max: f32) -> (f32, f32) {
    if is_sh {
        (min, max)
    } else {
        (-DEFAULT_8BIT_HALF_RANGE, DEFAULT_8BIT_HALF_RANGE)
    }
}

/// A scalar exactly as it is stored at some compression level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawScalar {
    F32(f32),
    F16(f16),
    U8(u8),
}

impl RawScalar {
    pub fn level(self) -> CompressionLevel {
        match self {
            RawScalar::F32(_) => CompressionLevel::Full,
            RawScalar::F16(_) => CompressionLevel::Half,
            RawScalar::U8(_) => CompressionLevel::Quantized,
        }
    }

    pub fn to_f32(self, is_sh: bool, min: f32, max: f32) -> f32 {
        match self {
            RawScalar::F32(v) => v,
            RawScalar::F16(v) => v.to_f32(),
            RawScalar::U8(v) => {
                let (min, max) = quantize_range(is_sh, min, max);
                from_uint8(v, min, max)
            }
        }
    }

    pub fn from_f32(value: f32, level: CompressionLevel, is_sh: bool, min: f32, max: f32) -> Self {
        match level {
            CompressionLevel::Full => RawScalar::F32(value),
            CompressionLevel::Half => RawScalar::F16(f16::from_f32(value)),
            CompressionLevel::Quantized => {
                let (min, max) = quantize_range(is_sh, min, max);
                RawScalar::U8(to_uint8(value, min, max))
            }
        }
    }

    /// Re-encode at `to`. Values already at `to` pass through untouched so
    /// repeated conversion never drifts.
    pub fn convert(self, to: CompressionLevel, is_sh: bool, min: f32, max: f32) -> Self {
        if self.level() == to {
            return self;
        }
        match (self, to) {
            (RawScalar::F16(v), CompressionLevel::Full) => RawScalar::F32(v.to_f32()),
            (RawScalar::F32(v), CompressionLevel::Half) => RawScalar::F16(f16::from_f32(v)),
            _ => Self::from_f32(self.to_f32(is_sh, min, max), to, is_sh, min, max),
        }
    }
}

/// Element types a bulk fill can write into. The element type decides the
/// output compression level.
pub trait CompressedScalar: Copy + Default {
    const LEVEL: CompressionLevel;

    fn from_raw(raw: RawScalar, is_sh: bool, min: f32, max: f32) -> Self;

    fn from_f32(value: f32, is_sh: bool, min: f32, max: f32) -> Self {
        Self::from_raw(RawScalar::F32(value), is_sh, min, max)
    }
}

impl CompressedScalar for f32 {
    const LEVEL: CompressionLevel = CompressionLevel::Full;

    fn from_raw(raw: RawScalar, is_sh: bool, min: f32, max: f32) -> Self {
        raw.to_f32(is_sh, min, max)
    }
}

impl CompressedScalar for f16 {
    const LEVEL: CompressionLevel = CompressionLevel::Half;

    fn from_raw(raw: RawScalar, is_sh: bool, min: f32, max: f32) -> Self {
        match raw.convert(CompressionLevel::Half, is_sh, min, max) {
            RawScalar::F16(v) => v,
            other => f16::from_f32(other.to_f32(is_sh, min, max)),
        }
    }
}

impl CompressedScalar for u8 {
    const LEVEL: CompressionLevel = CompressionLevel::Quantized;

    fn from_raw(raw: RawScalar, is_sh: bool, min: f32, max: f32) -> Self {
        match raw.convert(CompressionLevel::Quantized, is_sh, min, max) {
            RawScalar::U8(v) => v,
            other => {
                let (min, max) = quantize_range(is_sh, min, max);
                to_uint8(other.to_f32(is_sh, min, max), min, max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_roundtrip() {
        for v in [0.0f32, 1.0, -2.5, 0.333, 1000.0, -0.0001] {
            let back = from_half(to_half(v));
            assert!((back - v).abs() <= v.abs() * 1e-3 + 1e-7, "{} -> {}", v, back);
        }
    }

    #[test]
    fn test_half_saturates() {
        assert_eq!(from_half(to_half(1.0e6)), f32::INFINITY);
        assert_eq!(from_half(to_half(-1.0e6)), f32::NEG_INFINITY);
        assert_eq!(from_half(to_half(1.0e-9)), 0.0);
        assert!(from_half(to_half(f32::NAN)).is_nan());
    }

    #[test]
    fn test_uint8() {
        assert_eq!(to_uint8(-1.5, -1.5, 1.5), 0);
        assert_eq!(to_uint8(1.5, -1.5, 1.5), 255);
        assert_eq!(to_uint8(100.0, -1.5, 1.5), 255);
        assert_eq!(to_uint8(-100.0, -1.5, 1.5), 0);
        assert_eq!(to_uint8(0.0, -1.5, 1.5), 127);
        assert!((from_uint8(255, -1.5, 1.5) - 1.5).abs() < 1e-6);
        assert!((from_uint8(0, -2.0, 3.0) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_convert_same_level_is_identity() {
        for raw in [RawScalar::F32(0.123), RawScalar::F16(f16::from_f32(0.5)), RawScalar::U8(17)] {
            assert_eq!(raw.convert(raw.level(), true, -3.0, 2.0), raw);
        }
    }

    #[test]
    fn test_convert_idempotent() {
        let raw = RawScalar::F32(0.7);
        let once = raw.convert(CompressionLevel::Quantized, true, -1.0, 1.0);
        let twice = once.convert(CompressionLevel::Quantized, true, -1.0, 1.0);
        assert_eq!(once, twice);

        let once = raw.convert(CompressionLevel::Half, false, 0.0, 0.0);
        assert_eq!(once, once.convert(CompressionLevel::Half, false, 0.0, 0.0));
    }

    #[test]
    fn test_non_sh_uses_default_range() {
        let raw = RawScalar::F32(1.5).convert(CompressionLevel::Quantized, false, 0.0, 0.1);
        assert_eq!(raw, RawScalar::U8(255));
        let raw = RawScalar::F32(0.1).convert(CompressionLevel::Quantized, true, 0.0, 0.1);
        assert_eq!(raw, RawScalar::U8(255));
    }

    #[test]
    fn test_output_element_types() {
        let raw = RawScalar::U8(255);
        assert!((<f32 as CompressedScalar>::from_raw(raw, true, -1.0, 1.0) - 1.0).abs() < 1e-6);
        assert_eq!(<u8 as CompressedScalar>::from_raw(raw, true, -1.0, 1.0), 255);
        assert_eq!(<f16 as CompressedScalar>::from_f32(0.25, false, 0.0, 0.0), f16::from_f32(0.25));
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(CompressionLevel::try_from(2u16).unwrap(), CompressionLevel::Quantized);
        assert!(CompressionLevel::try_from(3u16).is_err());
        assert_eq!(CompressionLevel::from_enum_str("half").unwrap(), CompressionLevel::Half);
    }
}
