//! LSB-first bit packing for move bodies.

use crate::ProtocolError;

#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for bit in 0..count {
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> bit) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(u64::from(value), 1);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(u64::from(value), 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(u64::from(value), 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(u64::from(value), 32);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.position
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u64, ProtocolError> {
        if count as usize > self.remaining_bits() {
            return Err(ProtocolError::Decode("unexpected eof".into()));
        }
        let mut value = 0u64;
        for bit in 0..count {
            let byte = self.data[self.position / 8];
            if (byte >> (self.position % 8)) & 1 == 1 {
                value |= 1 << bit;
            }
            self.position += 1;
        }
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.read_bits(32)? as u32)
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Fails when more than the final byte's padding is left unread.
    pub fn finish(&self, what: &str) -> Result<(), ProtocolError> {
        if self.remaining_bits() >= 8 {
            return Err(ProtocolError::Decode(format!("{what} trailing bytes")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_widths_pack_tightly() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_bits(0b101, 3);
        writer.write_u16(0xBEEF);
        writer.write_f32(-2.5);
        assert_eq!(writer.bit_len(), 52);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 7);

        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().expect("flag"));
        assert_eq!(reader.read_bits(3).expect("bits"), 0b101);
        assert_eq!(reader.read_u16().expect("u16"), 0xBEEF);
        assert_eq!(reader.read_f32().expect("f32"), -2.5);
        reader.finish("test").expect("only padding left");
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn finish_rejects_extra_bytes() {
        let bytes = [0u8; 3];
        let mut reader = BitReader::new(&bytes);
        reader.read_u8().expect("first byte");
        assert!(reader.finish("test").is_err());
    }
}
