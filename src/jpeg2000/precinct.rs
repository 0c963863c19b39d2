//! Precincts: the unit of packet formation and of readiness tracking.

use std::collections::VecDeque;

use super::packet::{PacketRecord, PrecinctState, SubbandBlocks, form_packet, packet_size};
use crate::error::PcrdError;

/// Identifies a precinct within the codestream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrecinctRef {
    pub tile: usize,
    pub component: usize,
    pub resolution: usize,
    pub index: usize,
}

impl PrecinctRef {
    pub fn new(tile: usize, component: usize, resolution: usize, index: usize) -> Self {
        Self {
            tile,
            component,
            resolution,
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecinctStatus {
    /// Code-blocks not yet delivered.
    Pending,
    /// Code-blocks installed; packets are being formed or sequenced.
    Ready,
    /// Every packet has been emitted and the code-block data dropped.
    Released,
}

/// Pass counts per subband and code-block.
pub type Selection = Vec<Vec<usize>>;

/// A next truncation point a block could still add to the final layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillCandidate {
    pub slope: u16,
    pub subband: usize,
    pub block: usize,
}

#[derive(Debug)]
pub struct Precinct {
    status: PrecinctStatus,
    num_layers: u16,
    next_layer_idx: u16,
    finalized_layers: u16,
    subbands: Vec<SubbandBlocks>,
    coding: Option<PrecinctState>,
    packets: VecDeque<PacketRecord>,
}

impl Precinct {
    pub fn new(num_layers: u16) -> Self {
        Self {
            status: PrecinctStatus::Pending,
            num_layers,
            next_layer_idx: 0,
            finalized_layers: 0,
            subbands: Vec::new(),
            coding: None,
            packets: VecDeque::new(),
        }
    }

    pub fn status(&self) -> PrecinctStatus {
        self.status
    }

    /// Index of the next layer whose packet the progression has not yet visited.
    pub fn next_layer_idx(&self) -> u16 {
        self.next_layer_idx
    }

    pub fn finalized_layers(&self) -> u16 {
        self.finalized_layers
    }

    pub fn is_fully_finalized(&self) -> bool {
        self.finalized_layers == self.num_layers
    }

    pub fn install(&mut self, subbands: Vec<SubbandBlocks>, expected_subbands: usize) -> Result<(), PcrdError> {
        if self.status != PrecinctStatus::Pending {
            return Err(PcrdError::PrecinctAlreadySubmitted);
        }
        if subbands.len() != expected_subbands {
            log::error!("precinct delivered {} subbands, expected {}", subbands.len(), expected_subbands);
            return Err(PcrdError::SubbandCountMismatch);
        }
        self.coding = Some(PrecinctState::new(&subbands));
        self.subbands = subbands;
        self.status = PrecinctStatus::Ready;
        Ok(())
    }

    /// Pass counts selected by `threshold`, never below what earlier layers
    /// already committed.
    pub fn selection(&self, threshold: u16) -> Selection {
        let Some(coding) = &self.coding else {
            return Vec::new();
        };
        self.subbands
            .iter()
            .enumerate()
            .map(|(s, sb)| {
                sb.blocks
                    .iter()
                    .enumerate()
                    .map(|(b, block)| block.truncation_index(threshold).max(coding.block(s, b).passes_included))
                    .collect()
            })
            .collect()
    }

    /// Bytes this precinct adds to the codestream through `layer` if the
    /// first layer not yet finalized carries `selection` and every layer
    /// after it up to `layer` is empty.
    pub fn packet_cost(&self, layer: u16, selection: &[Vec<usize>]) -> u64 {
        let Some(coding) = &self.coding else {
            return 0;
        };
        if self.finalized_layers > layer {
            return 0;
        }
        let (header, body) = packet_size(self.finalized_layers, &self.subbands, coding, selection);
        let empty_layers = (layer - self.finalized_layers) as u64;
        header as u64 + body as u64 + empty_layers
    }

    /// Distortion reduction gained by raising the committed passes to `selection`.
    pub fn distortion_gain(&self, selection: &[Vec<usize>]) -> f64 {
        let Some(coding) = &self.coding else {
            return 0.0;
        };
        let mut gain = 0.0;
        for (s, sb) in self.subbands.iter().enumerate() {
            for (b, block) in sb.blocks.iter().enumerate() {
                let from = coding.block(s, b).passes_included;
                gain += block.distortion_reduction_at(selection[s][b]) - block.distortion_reduction_at(from);
            }
        }
        gain
    }

    /// Blocks whose next truncation point lies below the current selection.
    pub fn fill_candidates(&self, selection: &[Vec<usize>]) -> Vec<FillCandidate> {
        let mut candidates = Vec::new();
        for (s, sb) in self.subbands.iter().enumerate() {
            for (b, block) in sb.blocks.iter().enumerate() {
                let next = selection[s][b] + 1;
                if next <= block.num_passes() {
                    candidates.push(FillCandidate {
                        slope: block.slope_at(next),
                        subband: s,
                        block: b,
                    });
                }
            }
        }
        candidates
    }

    /// Forms and stores the packet of the next layer.
    pub fn finalize_layer(&mut self, selection: &[Vec<usize>]) -> Result<&PacketRecord, PcrdError> {
        if self.status != PrecinctStatus::Ready || self.is_fully_finalized() {
            return Err(PcrdError::InvalidOperation);
        }
        let Some(coding) = self.coding.as_mut() else {
            return Err(PcrdError::InvalidOperation);
        };
        let packet = form_packet(self.finalized_layers, &self.subbands, coding, selection);
        self.finalized_layers += 1;
        self.packets.push_back(packet);
        self.packets.back().ok_or(PcrdError::InvalidOperation)
    }

    /// True when the packet for `layer` is formed and next in line.
    pub fn has_packet(&self, layer: u16) -> bool {
        self.next_layer_idx == layer && self.packets.front().is_some_and(|p| p.layer == layer)
    }

    /// Hands the packet for `layer` to the emitter. After the last layer the
    /// code-block data, coding state and packet buffer are dropped.
    pub fn take_packet(&mut self, layer: u16) -> Result<PacketRecord, PcrdError> {
        if !self.has_packet(layer) {
            return Err(PcrdError::InvalidOperation);
        }
        let packet = self.packets.pop_front().ok_or(PcrdError::InvalidOperation)?;
        self.next_layer_idx += 1;
        if self.next_layer_idx == self.num_layers {
            self.subbands = Vec::new();
            self.coding = None;
            self.packets = VecDeque::new();
            self.status = PrecinctStatus::Released;
        }
        Ok(packet)
    }
}
