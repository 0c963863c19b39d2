//! Packet header bit I/O.
//!
//! Packet headers are written MSB first. After a byte equal to 0xFF only
//! seven bits are packed into the following byte, whose MSB is a stuffed
//! zero (ISO/IEC 15444-1, B.10.1).

pub struct J2kBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u8,
    bits_left: u8,
    last_byte: u8,
}

impl<'a> J2kBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bits_left: 0,
            last_byte: 0,
        }
    }

    pub fn read_bit(&mut self) -> Option<u8> {
        if self.bits_left == 0 {
            let b = *self.data.get(self.pos)?;
            self.pos += 1;
            self.bits_left = if self.last_byte == 0xFF { 7 } else { 8 };
            self.bit_buffer = b;
            self.last_byte = b;
        }

        let bit = (self.bit_buffer >> (self.bits_left - 1)) & 1;
        self.bits_left -= 1;
        Some(bit)
    }

    pub fn read_bits(&mut self, count: u8) -> Option<u32> {
        let mut bits = 0u32;
        for _ in 0..count {
            bits = (bits << 1) | self.read_bit()? as u32;
        }
        Some(bits)
    }

    /// Number of header bytes consumed so far (a partially read byte counts).
    pub fn position(&self) -> usize {
        self.pos
    }
}

#[derive(Debug, Clone, Default)]
pub struct J2kBitWriter {
    data: Vec<u8>,
    bit_buffer: u8,
    bits_count: u8,
    bits_capacity: u8,
}

impl J2kBitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer: 0,
            bits_count: 0,
            bits_capacity: 8,
        }
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.bit_buffer = (self.bit_buffer << 1) | (bit & 1);
        self.bits_count += 1;
        if self.bits_count == self.bits_capacity {
            self.flush_byte();
        }
    }

    pub fn write_bits(&mut self, value: u32, count: u8) {
        for shift in (0..count).rev() {
            self.write_bit(((value >> shift) & 1) as u8);
        }
    }

    fn flush_byte(&mut self) {
        let b = self.bit_buffer;
        self.data.push(b);
        self.bits_capacity = if b == 0xFF { 7 } else { 8 };
        self.bit_buffer = 0;
        self.bits_count = 0;
    }

    /// Bytes the header would occupy if finished now.
    pub fn byte_len(&self) -> usize {
        let pending = usize::from(self.bits_count > 0);
        let trailing_ff = self.bits_count == 0 && self.data.last() == Some(&0xFF);
        self.data.len() + pending + usize::from(trailing_ff)
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_count > 0 {
            self.bit_buffer <<= self.bits_capacity - self.bits_count;
            self.flush_byte();
        }
        // A header may not end on 0xFF.
        if self.data.last() == Some(&0xFF) {
            self.data.push(0x00);
        }
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_stuffing_after_ff() {
        let mut writer = J2kBitWriter::new();
        writer.write_bits(0xFF, 8);
        // Next byte only holds seven bits.
        writer.write_bits(0x7F, 7);
        writer.write_bit(1);
        assert_eq!(writer.byte_len(), 3);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x80]);

        let mut reader = J2kBitReader::new(&bytes);
        assert_eq!(reader.read_bits(8), Some(0xFF));
        assert_eq!(reader.read_bits(7), Some(0x7F));
        assert_eq!(reader.read_bit(), Some(1));
    }

    #[test]
    fn test_finish_never_ends_on_ff() {
        let mut writer = J2kBitWriter::new();
        writer.write_bits(0xFF, 8);
        assert_eq!(writer.byte_len(), 2);
        assert_eq!(writer.finish(), vec![0xFF, 0x00]);
    }

    #[test]
    fn test_empty_packet_bit() {
        let mut writer = J2kBitWriter::new();
        writer.write_bit(0);
        assert_eq!(writer.finish(), vec![0x00]);
    }
}
