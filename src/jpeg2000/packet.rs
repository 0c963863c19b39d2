//! Packet header and body formation for one precinct and one quality layer.

use super::bit_io::J2kBitWriter;
use super::codeblock::CodeBlock;
use super::image::SubbandOrientation;
use super::tag_tree::TagTree;
use crate::constants::{INITIAL_LBLOCK, MAXIMUM_PASSES_PER_PACKET};
use crate::error::PcrdError;

/// The code-blocks of one subband of a precinct, in raster order.
#[derive(Debug, Clone)]
pub struct SubbandBlocks {
    pub orientation: SubbandOrientation,
    pub grid_width: usize,
    pub grid_height: usize,
    pub blocks: Vec<CodeBlock>,
}

impl SubbandBlocks {
    pub fn new(
        orientation: SubbandOrientation,
        grid_width: usize,
        grid_height: usize,
        blocks: Vec<CodeBlock>,
    ) -> Result<Self, PcrdError> {
        if blocks.len() != grid_width * grid_height {
            log::error!(
                "subband {:?}: {} blocks for a {}x{} grid",
                orientation,
                blocks.len(),
                grid_width,
                grid_height
            );
            return Err(PcrdError::InvalidArgument);
        }
        if blocks.iter().any(|b| b.num_passes() > MAXIMUM_PASSES_PER_PACKET) {
            return Err(PcrdError::InvalidTruncationTable);
        }
        Ok(Self {
            orientation,
            grid_width,
            grid_height,
            blocks,
        })
    }
}

/// Per code-block header coding state carried from layer to layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCodingState {
    pub passes_included: usize,
    pub lblock: u8,
    pub included: bool,
}

impl Default for BlockCodingState {
    fn default() -> Self {
        Self {
            passes_included: 0,
            lblock: INITIAL_LBLOCK,
            included: false,
        }
    }
}

#[derive(Debug, Clone)]
struct SubbandCodingState {
    grid_width: usize,
    inclusion_tree: TagTree,
    zero_bp_tree: TagTree,
    blocks: Vec<BlockCodingState>,
}

/// Header coding state of a precinct: the tag trees and block states of all
/// its subbands.
#[derive(Debug, Clone)]
pub struct PrecinctState {
    subbands: Vec<SubbandCodingState>,
}

impl PrecinctState {
    pub fn new(subbands: &[SubbandBlocks]) -> Self {
        let subbands = subbands
            .iter()
            .map(|sb| {
                let mut zero_bp_tree = TagTree::new(sb.grid_width, sb.grid_height);
                for (i, block) in sb.blocks.iter().enumerate() {
                    zero_bp_tree.set_value(
                        i % sb.grid_width,
                        i / sb.grid_width,
                        block.missing_msbs() as i32,
                    );
                }
                SubbandCodingState {
                    grid_width: sb.grid_width,
                    inclusion_tree: TagTree::new(sb.grid_width, sb.grid_height),
                    zero_bp_tree,
                    blocks: vec![BlockCodingState::default(); sb.blocks.len()],
                }
            })
            .collect();
        Self { subbands }
    }

    pub fn block(&self, subband: usize, block: usize) -> &BlockCodingState {
        &self.subbands[subband].blocks[block]
    }

    /// Passes already committed to earlier layers, per subband and block.
    pub fn committed_selection(&self) -> Vec<Vec<usize>> {
        self.subbands
            .iter()
            .map(|sb| sb.blocks.iter().map(|b| b.passes_included).collect())
            .collect()
    }
}

/// Contribution of one code-block to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlockInfo {
    pub first_pass: usize,
    pub num_passes: usize,
    pub data_len: u32,
    pub zero_bp: u8,
}

pub struct PacketHeader {
    pub layer_index: u16,
    pub empty: bool,
    /// Per subband, per block (raster order): the block's contribution, if any.
    pub included_cblks: Vec<Vec<Option<CodeBlockInfo>>>,
}

impl PacketHeader {
    /// Describes the packet that raises every block of the precinct from its
    /// committed pass count to `selection`.
    pub fn build(
        layer_index: u16,
        subbands: &[SubbandBlocks],
        state: &PrecinctState,
        selection: &[Vec<usize>],
    ) -> Self {
        let mut empty = true;
        let included_cblks = subbands
            .iter()
            .enumerate()
            .map(|(s, sb)| {
                sb.blocks
                    .iter()
                    .enumerate()
                    .map(|(b, block)| {
                        let from = state.block(s, b).passes_included;
                        let to = selection[s][b];
                        if to <= from {
                            return None;
                        }
                        empty = false;
                        Some(CodeBlockInfo {
                            first_pass: from,
                            num_passes: to - from,
                            data_len: block.length_at(to) - block.length_at(from),
                            zero_bp: block.missing_msbs(),
                        })
                    })
                    .collect()
            })
            .collect();

        Self {
            layer_index,
            empty,
            included_cblks,
        }
    }

    /// Write the packet header to the bit stream, advancing the precinct state.
    pub fn write(&self, writer: &mut J2kBitWriter, state: &mut PrecinctState) {
        if self.empty {
            writer.write_bit(0);
            return;
        }
        writer.write_bit(1);

        let layer = self.layer_index as i32;
        for (sb_state, contributions) in state.subbands.iter_mut().zip(&self.included_cblks) {
            // Every first inclusion of this layer must be known to the tree
            // before any leaf is coded against it.
            for (i, cb) in contributions.iter().enumerate() {
                if cb.is_some() && !sb_state.blocks[i].included {
                    sb_state.inclusion_tree.set_value(
                        i % sb_state.grid_width,
                        i / sb_state.grid_width,
                        layer,
                    );
                }
            }

            for (i, cb) in contributions.iter().enumerate() {
                let x = i % sb_state.grid_width;
                let y = i / sb_state.grid_width;
                let block = &mut sb_state.blocks[i];

                if block.included {
                    writer.write_bit(u8::from(cb.is_some()));
                } else {
                    sb_state.inclusion_tree.encode(writer, x, y, layer + 1);
                }

                let Some(cb) = cb else {
                    continue;
                };

                if !block.included {
                    sb_state
                        .zero_bp_tree
                        .encode(writer, x, y, cb.zero_bp as i32 + 1);
                    block.included = true;
                }

                write_num_passes(writer, cb.num_passes);

                let pass_bits = floor_log2(cb.num_passes as u32);
                let needed = 32 - cb.data_len.leading_zeros();
                while needed > block.lblock as u32 + pass_bits {
                    writer.write_bit(1);
                    block.lblock += 1;
                }
                writer.write_bit(0);
                writer.write_bits(cb.data_len, block.lblock + pass_bits as u8);

                block.passes_included = cb.first_pass + cb.num_passes;
            }
        }
    }
}

/// Codeword for the number of new coding passes (ISO/IEC 15444-1, table B.4).
fn write_num_passes(writer: &mut J2kBitWriter, passes: usize) {
    let n = passes as u32;
    match n {
        1 => writer.write_bit(0),
        2 => writer.write_bits(0b10, 2),
        3..=5 => {
            writer.write_bits(0b11, 2);
            writer.write_bits(n - 3, 2);
        }
        6..=36 => {
            writer.write_bits(0b1111, 4);
            writer.write_bits(n - 6, 5);
        }
        _ => {
            writer.write_bits(0b1_1111_1111, 9);
            writer.write_bits(n - 37, 7);
        }
    }
}

fn floor_log2(v: u32) -> u32 {
    31 - v.max(1).leading_zeros()
}

/// A formed packet, waiting for its turn in the progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub layer: u16,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl PacketRecord {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forms the packet for `layer`, committing the new pass counts to `state`.
pub fn form_packet(
    layer: u16,
    subbands: &[SubbandBlocks],
    state: &mut PrecinctState,
    selection: &[Vec<usize>],
) -> PacketRecord {
    let header = PacketHeader::build(layer, subbands, state, selection);
    let mut writer = J2kBitWriter::new();
    header.write(&mut writer, state);

    let mut body = Vec::new();
    for (sb, contributions) in subbands.iter().zip(&header.included_cblks) {
        for (block, cb) in sb.blocks.iter().zip(contributions) {
            if let Some(cb) = cb {
                body.extend_from_slice(block.code_bytes(cb.first_pass, cb.first_pass + cb.num_passes));
            }
        }
    }

    PacketRecord {
        layer,
        header: writer.finish(),
        body,
    }
}

/// Size of the packet `form_packet` would produce, leaving `state` untouched.
pub fn packet_size(
    layer: u16,
    subbands: &[SubbandBlocks],
    state: &PrecinctState,
    selection: &[Vec<usize>],
) -> (u32, u32) {
    let header = PacketHeader::build(layer, subbands, state, selection);
    if header.empty {
        return (1, 0);
    }
    let body: u32 = header
        .included_cblks
        .iter()
        .flatten()
        .flatten()
        .map(|cb| cb.data_len)
        .sum();
    let mut scratch = state.clone();
    let mut writer = J2kBitWriter::new();
    header.write(&mut writer, &mut scratch);
    (writer.byte_len() as u32, body)
}
