// Rate tolerance applied to the lower bound of sized layers (fraction of the target).
pub const DEFAULT_RATE_TOLERANCE: f64 = 0.02;
pub const MAXIMUM_RATE_TOLERANCE: f64 = 0.5;

// Slope thresholds are 16-bit logarithmic distortion-length slopes.
pub const MINIMUM_SLOPE_THRESHOLD: u16 = 0;
pub const MAXIMUM_SLOPE_THRESHOLD: u16 = u16::MAX;

// Threshold units per factor of two in distortion-length slope.
pub const SLOPE_UNITS_PER_OCTAVE: u16 = 256;

// Separation used for unconstrained layers that have no sized neighbour on one side.
pub const DEFAULT_LAYER_SLOPE_SPACING: u16 = SLOPE_UNITS_PER_OCTAVE;

// Seed for the secant step: threshold units per doubling of the byte count.
// Purely a convergence speed parameter.
pub const DEFAULT_INITIAL_GRADIENT: f64 = -512.0;

// Upper bound on search iterations; bisection alone needs at most 17.
pub const MAXIMUM_SEARCH_ITERATIONS: usize = 48;

// ISO/IEC 15444-1, B.10.7.1: initial value of the code-block length indicator.
pub const INITIAL_LBLOCK: u8 = 3;

// ISO/IEC 15444-1, table B.4 limits the number of new passes to 164 per packet.
pub const MAXIMUM_PASSES_PER_PACKET: usize = 164;

pub const MAXIMUM_PRECINCT_EXPONENT: u8 = 15;
pub const MAXIMUM_DECOMPOSITION_LEVELS: u8 = 32;
pub const MAXIMUM_QUALITY_LAYERS: u16 = u16::MAX;

// SOT marker segment (12 bytes) plus SOD marker (2 bytes).
pub const TILE_PART_HEADER_SIZE: usize = 14;

// Psot field offset within a tile-part header.
pub const PSOT_OFFSET: usize = 6;
