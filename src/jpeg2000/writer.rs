use num_enum::IntoPrimitive;

use super::progression::ProgressionChange;
use crate::constants::PSOT_OFFSET;

/// Second byte of the codestream markers written here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum J2kMarkerCode {
    StartOfTile = 0x90,
    StartOfData = 0x93,
    ProgressionOrderChange = 0x5F,
}

/// Tile-part writer. Grows its buffer as packets are appended.
#[derive(Debug, Default)]
pub struct J2kWriter {
    data: Vec<u8>,
}

impl J2kWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_marker(&mut self, marker: J2kMarkerCode) {
        self.data.push(0xFF);
        self.data.push(marker.into());
    }

    pub fn write_byte(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Writes an SOT segment and returns its offset, for `patch_psot`.
    pub fn write_sot(&mut self, tile_index: u16, tile_len: u32, tile_part_index: u8, num_tile_parts: u8) -> usize {
        let start = self.data.len();
        self.write_marker(J2kMarkerCode::StartOfTile);
        self.write_u16(10); // Lsot
        self.write_u16(tile_index);
        self.write_u32(tile_len); // Psot
        self.write_byte(tile_part_index); // TPsot
        self.write_byte(num_tile_parts); // TNsot, 0 when unknown
        start
    }

    /// Writes a POC segment. Component fields take two bytes once the image
    /// has more than 256 components.
    pub fn write_poc(&mut self, changes: &[ProgressionChange], component_count: usize) {
        let wide = component_count > 256;
        let record_len = if wide { 9 } else { 7 };
        self.write_marker(J2kMarkerCode::ProgressionOrderChange);
        self.write_u16((2 + changes.len() * record_len) as u16);
        for change in changes {
            self.write_byte(change.resolution_start); // RSpoc
            if wide {
                self.write_u16(change.component_start);
            } else {
                self.write_byte(change.component_start as u8);
            }
            self.write_u16(change.layer_end); // LYEpoc
            self.write_byte(change.resolution_end); // REpoc
            if wide {
                self.write_u16(change.component_end);
            } else {
                // CEpoc of 0 stands for 256.
                self.write_byte(change.component_end as u8);
            }
            self.write_byte(change.order.into()); // Ppoc
        }
    }

    pub fn write_sod(&mut self) {
        self.write_marker(J2kMarkerCode::StartOfData);
    }

    /// Fills in the Psot field of the SOT segment at `sot_start`.
    pub fn patch_psot(&mut self, sot_start: usize, psot: u32) {
        let at = sot_start + PSOT_OFFSET;
        self.data[at..at + 4].copy_from_slice(&psot.to_be_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::progression::ProgressionOrder;

    #[test]
    fn test_tile_part_header() {
        let mut writer = J2kWriter::new();
        let sot = writer.write_sot(3, 0, 1, 0);
        writer.write_sod();
        writer.write_bytes(&[0x11, 0x22]);
        let len = writer.len() as u32;
        writer.patch_psot(sot, len);

        let written = writer.into_inner();
        assert_eq!(&written[..4], &[0xFF, 0x90, 0x00, 0x0A]);
        assert_eq!(&written[4..6], &[0x00, 0x03]);
        assert_eq!(&written[6..10], &16u32.to_be_bytes());
        assert_eq!(&written[10..12], &[0x01, 0x00]);
        assert_eq!(&written[12..14], &[0xFF, 0x93]);
        assert_eq!(&written[14..], &[0x11, 0x22]);
    }

    #[test]
    fn test_poc_segment() {
        let mut writer = J2kWriter::new();
        let change = ProgressionChange {
            order: ProgressionOrder::ResolutionPositionComponentLayer,
            layer_end: 5,
            resolution_start: 1,
            resolution_end: 3,
            component_start: 0,
            component_end: 3,
        };
        writer.write_poc(&[change], 3);
        assert_eq!(
            writer.into_inner(),
            vec![0xFF, 0x5F, 0x00, 0x09, 1, 0, 0x00, 0x05, 3, 3, 2]
        );
    }
}
