pub mod constants;
pub mod error;
pub mod jpeg2000;

pub use error::PcrdError;
pub use jpeg2000::codeblock::{CodeBlock, TruncationPoint};
pub use jpeg2000::codestream::SharedCodestream;
pub use jpeg2000::emitter::{CodestreamOutput, FlushOutcome, TilePart};
pub use jpeg2000::image::{CodestreamParams, ComponentParams, Rect, SubbandOrientation};
pub use jpeg2000::layers::{LayerResult, LayerSpec, layer_targets_from_rates};
pub use jpeg2000::packet::SubbandBlocks;
pub use jpeg2000::precinct::PrecinctRef;
pub use jpeg2000::progression::{ProgressionChange, ProgressionOrder};
pub use jpeg2000::rate_control::{RateControlConfig, RateControlContext, ResolutionLengthLimits};
