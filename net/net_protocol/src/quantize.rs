//! Fixed-point vectors and compressed rotations.

use rapier3d::math::Vector;
use rapier3d::prelude::Real;

use crate::bits::{BitReader, BitWriter};
use crate::ProtocolError;

const BIT_COUNT_BITS: u32 = 5;

/// Scale and range of a quantized vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantize {
    pub scale: Real,
    pub max_magnitude: Real,
}

/// One decimal place, up to 2^20 units per component.
pub const NET_QUANTIZE_10: Quantize = Quantize {
    scale: 10.0,
    max_magnitude: 1_048_576.0,
};

/// Two decimal places, up to 2^17 units per component.
pub const NET_QUANTIZE_100: Quantize = Quantize {
    scale: 100.0,
    max_magnitude: 131_072.0,
};

impl Quantize {
    /// Value the receiver will see for `value`.
    pub fn round_trip(&self, value: Vector<Real>) -> Vector<Real> {
        value.map(|component| self.to_fixed(component) as Real / self.scale)
    }

    fn to_fixed(&self, component: Real) -> i32 {
        let clamped = if component.is_finite() {
            component.clamp(-self.max_magnitude, self.max_magnitude)
        } else {
            0.0
        };
        (clamped * self.scale).round() as i32
    }

    pub fn write(&self, writer: &mut BitWriter, value: Vector<Real>) {
        let encoded = [
            zig_zag(self.to_fixed(value.x)),
            zig_zag(self.to_fixed(value.y)),
            zig_zag(self.to_fixed(value.z)),
        ];
        let widest = encoded.iter().copied().max().unwrap_or(0);
        let bits = u32::BITS - widest.leading_zeros();
        writer.write_bits(u64::from(bits), BIT_COUNT_BITS);
        for component in encoded {
            writer.write_bits(u64::from(component), bits);
        }
    }

    pub fn read(&self, reader: &mut BitReader<'_>) -> Result<Vector<Real>, ProtocolError> {
        let bits = reader.read_bits(BIT_COUNT_BITS)? as u32;
        let mut components = [0.0; 3];
        for component in &mut components {
            let raw = reader.read_bits(bits)? as u32;
            *component = un_zig_zag(raw) as Real / self.scale;
        }
        Ok(Vector::new(components[0], components[1], components[2]))
    }
}

fn zig_zag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn un_zig_zag(value: u32) -> i32 {
    (value >> 1) as i32 ^ -((value & 1) as i32)
}

pub fn compress_axis_to_short(angle: Real) -> u16 {
    ((angle * 65536.0 / 360.0).round() as i64 & 0xFFFF) as u16
}

pub fn decompress_axis_from_short(value: u16) -> Real {
    Real::from(value) * 360.0 / 65536.0
}

pub fn compress_axis_to_byte(angle: Real) -> u8 {
    ((angle * 256.0 / 360.0).round() as i64 & 0xFF) as u8
}

pub fn decompress_axis_from_byte(value: u8) -> Real {
    Real::from(value) * 360.0 / 256.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantized_vector_keeps_two_decimals() {
        let value = Vector::new(123.456, -0.004, 98_765.43);
        let mut writer = BitWriter::new();
        NET_QUANTIZE_100.write(&mut writer, value);
        let bytes = writer.into_bytes();
        let decoded = NET_QUANTIZE_100
            .read(&mut BitReader::new(&bytes))
            .expect("decode vector");
        assert!((decoded - value).abs().max() <= 0.005 + 1.0e-3);
        assert_eq!(decoded, NET_QUANTIZE_100.round_trip(value));
    }

    #[test]
    fn zero_vector_costs_only_the_bit_count() {
        let mut writer = BitWriter::new();
        NET_QUANTIZE_10.write(&mut writer, Vector::zeros());
        assert_eq!(writer.bit_len(), 5);
    }

    #[test]
    fn out_of_range_components_are_clamped() {
        let value = Vector::new(1.0e9, -1.0e9, Real::NAN);
        let clamped = NET_QUANTIZE_10.round_trip(value);
        assert_eq!(clamped, Vector::new(1_048_576.0, -1_048_576.0, 0.0));
    }

    #[test]
    fn rotation_compression_wraps() {
        assert_eq!(compress_axis_to_short(90.0), 16384);
        assert_eq!(compress_axis_to_short(-90.0), 49152);
        assert_eq!(compress_axis_to_short(360.0), 0);
        assert_eq!(decompress_axis_from_short(16384), 90.0);
        assert_eq!(compress_axis_to_byte(180.0), 128);
        assert_eq!(decompress_axis_from_byte(64), 90.0);
    }
}
