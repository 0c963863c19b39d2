//! JPEG 2000 quality layer formation and packet sequencing (ISO/IEC 15444-1)
//!
//! Code-blocks arrive from an external block coder together with their
//! truncation point tables. This module decides how much of each block goes
//! into each quality layer and writes the resulting packets in progression
//! order:
//!
//! - `codeblock` / `precinct` / `image`: code-blocks, precincts and the tile geometry holding them.
//! - `packet` / `tag_tree` / `bit_io`: packet header and body formation.
//! - `rate_control` / `layers`: PCRD-opt threshold search and layer allocation.
//! - `progression`: packet sequencing over progression order change records.
//! - `emitter` / `writer`: tile-part output, sequential or incremental.
//! - `ready` / `codestream`: hand-off from block-coding threads.

pub mod bit_io;
pub mod codeblock;
pub mod codestream;
pub mod emitter;
pub mod image;
pub mod layers;
pub mod packet;
pub mod precinct;
pub mod progression;
pub mod rate_control;
pub mod ready;
pub mod tag_tree;
pub mod writer;
