//! Packet emission: sequential (whole image at once) and incremental
//! (flush whatever the progression allows as precincts arrive).

use super::layers::LayerResult;
use super::precinct::PrecinctRef;
use super::rate_control::RateControlContext;
use super::writer::J2kWriter;
use crate::error::PcrdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedPacket {
    pub precinct: PrecinctRef,
    pub layer: u16,
    /// Header plus body bytes.
    pub len: usize,
}

/// A tile-part: SOT segment, optional POC segment, SOD and packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePart {
    pub tile: usize,
    pub index: u8,
    pub packets: Vec<EmittedPacket>,
    pub bytes: Vec<u8>,
}

/// Emission bookkeeping carried across flushes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitterState {
    tile_parts: Vec<u16>,
    announced_changes: Vec<usize>,
    pub bytes_written: u64,
    pub packets_written: u64,
    pub flushes: u32,
}

impl EmitterState {
    pub(crate) fn new(announced_changes: Vec<usize>) -> Self {
        Self {
            tile_parts: vec![0; announced_changes.len()],
            announced_changes,
            ..Default::default()
        }
    }

    /// Tile-parts written so far for `tile`.
    pub fn tile_parts(&self, tile: usize) -> u16 {
        self.tile_parts.get(tile).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Not enough of the image is ready to make progress.
    Deferred,
    Flushed {
        tile_parts: Vec<TilePart>,
        layers: Vec<LayerResult>,
    },
    /// Every packet of every tile has been emitted.
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodestreamOutput {
    pub layers: Vec<LayerResult>,
    pub tile_parts: Vec<TilePart>,
}

impl CodestreamOutput {
    /// Tile-part bytes in emission order.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.tile_parts.iter().flat_map(|tp| tp.bytes.iter().copied()).collect()
    }
}

impl RateControlContext {
    pub fn emitter_state(&self) -> &EmitterState {
        &self.emitter
    }

    pub fn is_complete(&self) -> bool {
        self.tiles.iter().all(|t| t.is_complete())
    }

    /// Allocates layers and emits every packet once all code-blocks have
    /// been delivered. Each tile becomes a single tile-part.
    pub fn emit_sequential(&mut self) -> Result<CodestreamOutput, PcrdError> {
        self.collect_ready()?;
        if !self.is_fully_submitted() {
            log::error!("sequential emission with precincts still outstanding");
            return Err(PcrdError::InvalidOperation);
        }
        let layers = self.allocate_layers()?;
        let tile_parts = self.emit_ready_packets()?;
        self.check_complete()?;
        log::info!(
            "emitted {} tile-parts, {} bytes",
            tile_parts.len(),
            self.emitter.bytes_written
        );
        Ok(CodestreamOutput { layers, tile_parts })
    }

    /// True when flushing now can make progress without stalling the
    /// progression on resolutions that lag behind.
    ///
    /// A resolution with outstanding precincts but none ready is acceptable
    /// only if some higher resolution of the same tile-component has ready
    /// precincts reaching past its first outstanding precinct row.
    pub fn ready_for_flush(&self) -> bool {
        let mut any_ready = false;
        for tile in &self.tiles {
            for comp in &tile.components {
                for (r, res) in comp.resolutions.iter().enumerate() {
                    if res.has_ready() {
                        any_ready = true;
                        continue;
                    }
                    let Some(bottom) = res.first_pending_row_bottom() else {
                        continue;
                    };
                    let covered = comp.resolutions[r + 1..]
                        .iter()
                        .any(|higher| higher.has_ready() && higher.ready_extent() >= bottom);
                    if !covered {
                        return false;
                    }
                }
            }
        }
        any_ready
    }

    /// Collects ready precincts and, when ready for a flush, allocates their
    /// layers and emits one tile-part per tile whose progression can advance.
    pub fn flush(&mut self) -> Result<FlushOutcome, PcrdError> {
        self.collect_ready()?;
        if self.is_complete() {
            return Ok(FlushOutcome::Complete);
        }
        if !self.ready_for_flush() {
            log::trace!("flush deferred");
            return Ok(FlushOutcome::Deferred);
        }

        let layers = self.allocate_layers()?;
        let tile_parts = self.emit_ready_packets()?;
        if self.is_fully_submitted() {
            self.check_complete()?;
        }
        self.emitter.flushes += 1;
        log::info!(
            "flush {}: {:.1}% of the image ready, {} tile-parts, {} bytes so far",
            self.emitter.flushes,
            self.ready_fraction() * 100.0,
            tile_parts.len(),
            self.emitter.bytes_written
        );
        Ok(FlushOutcome::Flushed { tile_parts, layers })
    }

    fn emit_ready_packets(&mut self) -> Result<Vec<TilePart>, PcrdError> {
        let mut parts = Vec::new();
        for tile in 0..self.tiles.len() {
            if let Some(part) = self.emit_tile_part(tile)? {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    fn emit_tile_part(&mut self, t: usize) -> Result<Option<TilePart>, PcrdError> {
        if self.sequencers[t].peek(&self.tiles[t]).is_none() {
            return Ok(None);
        }
        let index = u8::try_from(self.emitter.tile_parts[t]).map_err(|_| {
            log::error!("tile {t} needs more than 255 tile-parts");
            PcrdError::InvalidOperation
        })?;
        let tile_index = u16::try_from(t).map_err(|_| PcrdError::InvalidOperation)?;

        let mut writer = J2kWriter::new();
        let sot = writer.write_sot(tile_index, 0, index, 0);
        let changes = self.sequencers[t].changes();
        let announced = self.emitter.announced_changes[t];
        if announced < changes.len() {
            writer.write_poc(&changes[announced..], self.tiles[t].components.len());
            self.emitter.announced_changes[t] = changes.len();
        }
        writer.write_sod();

        let mut packets = Vec::new();
        while let Some(next) = self.sequencers[t].next_in_sequence(&self.tiles[t]) {
            let packet = self.tiles[t].take_packet(next.precinct, next.layer)?;
            writer.write_bytes(&packet.header);
            writer.write_bytes(&packet.body);
            packets.push(EmittedPacket {
                precinct: next.precinct,
                layer: next.layer,
                len: packet.len(),
            });
        }

        let psot = u32::try_from(writer.len()).map_err(|_| PcrdError::InvalidOperation)?;
        writer.patch_psot(sot, psot);
        let bytes = writer.into_inner();

        self.emitter.tile_parts[t] += 1;
        self.emitter.bytes_written += bytes.len() as u64;
        self.emitter.packets_written += packets.len() as u64;
        log::debug!("tile {t} part {index}: {} packets, {} bytes", packets.len(), bytes.len());

        Ok(Some(TilePart {
            tile: t,
            index,
            packets,
            bytes,
        }))
    }

    /// With every precinct delivered and allocated, any packet left over was
    /// never reached by the progression.
    fn check_complete(&self) -> Result<(), PcrdError> {
        for tile in &self.tiles {
            if !tile.is_complete() {
                log::error!(
                    "tile {}: progression covers {} of {} packets",
                    tile.index,
                    tile.sequenced_packets(),
                    tile.relevant_packets()
                );
                return Err(PcrdError::IncompleteProgression);
            }
        }
        Ok(())
    }
}
