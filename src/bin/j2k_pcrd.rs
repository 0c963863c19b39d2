//! j2k-pcrd CLI - exercises JPEG 2000 quality layer formation on synthetic
//! code-block data.

use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::PathBuf;

use j2k_pcrd::{
    CodeBlock, CodestreamParams, ComponentParams, FlushOutcome, LayerResult, LayerSpec, PrecinctRef,
    ProgressionOrder, RateControlConfig, SharedCodestream, SubbandBlocks, SubbandOrientation, TilePart, layer_targets_from_rates,
};

/// JPEG 2000 PCRD-opt layer formation and packet sequencing
#[derive(Parser)]
#[command(name = "j2k-pcrd")]
#[command(version)]
#[command(about = "Forms JPEG 2000 quality layers and sequences packets", long_about = None)]
#[command(after_help = "EXAMPLES:
    j2k-pcrd simulate -w 512 -H 512 --levels 5 --layers 3 --rate 1.0,0.1
    j2k-pcrd simulate -w 1024 -H 768 -n 3 --order RPCL --precincts 7 --rate 0.5 --flush-period 2
    j2k-pcrd simulate -w 256 -H 256 --layers 2 --slopes 50000,0
    j2k-pcrd targets -w 512 -H 512 --layers 4 --rate 2.0,0.25")]
struct Cli {
    /// Log rate control decisions (info level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate quality layers for a synthetic codestream
    ///
    /// Code-blocks are generated from a seeded random source, so runs with
    /// the same arguments produce the same layers.
    #[command(visible_alias = "s")]
    Simulate {
        #[command(flatten)]
        image: ImageArgs,

        /// Wavelet decomposition levels
        #[arg(long, default_value = "5")]
        levels: u8,

        /// Precinct size exponent for every resolution (15 = one precinct)
        #[arg(long, default_value = "15")]
        precincts: u8,

        /// Bit-rate in bits/pixel as `max[,min]`
        #[arg(short, long, value_parser = parse_rate, conflicts_with = "slopes")]
        rate: Option<(f64, Option<f64>)>,

        /// Slope threshold per layer, non-increasing
        #[arg(long, value_delimiter = ',')]
        slopes: Option<Vec<u16>>,

        /// Rate tolerance in percent
        #[arg(long, default_value = "2")]
        tolerance: f64,

        /// Progression order: LRCP, RLCP, RPCL, PCRL or CPRL
        #[arg(long, default_value = "LRCP")]
        order: ProgressionOrder,

        /// Precinct rows per incremental flush; 0 emits everything at the end
        #[arg(long, default_value = "0")]
        flush_period: usize,

        /// Seed for the synthetic code-blocks
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Write the tile-parts to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the cumulative layer byte targets for a bit-rate
    #[command(visible_alias = "t")]
    Targets {
        #[command(flatten)]
        image: ImageArgs,

        /// Bit-rate in bits/pixel as `max[,min]`
        #[arg(short, long, value_parser = parse_rate)]
        rate: (f64, Option<f64>),
    },
}

#[derive(Args)]
struct ImageArgs {
    /// Image width in samples
    #[arg(short, long)]
    width: u32,

    /// Image height in samples
    #[arg(short = 'H', long)]
    height: u32,

    /// Number of components
    #[arg(short = 'n', long, default_value = "1")]
    components: u16,

    /// Number of quality layers
    #[arg(short, long, default_value = "1")]
    layers: u16,
}

impl ImageArgs {
    fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

fn parse_rate(s: &str) -> Result<(f64, Option<f64>), String> {
    let mut parts = s.split(',');
    let parse = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("invalid rate '{v}': {e}"));
    let max = parse(parts.next().unwrap_or_default())?;
    let min = parts.next().map(parse).transpose()?;
    if parts.next().is_some() {
        return Err("expected `max` or `max,min`".to_string());
    }
    Ok((max, min))
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let result = match cli.command {
        Commands::Simulate {
            image,
            levels,
            precincts,
            rate,
            slopes,
            tolerance,
            order,
            flush_period,
            seed,
            output,
        } => simulate(
            &image,
            levels,
            precincts,
            rate,
            slopes,
            tolerance,
            order,
            flush_period,
            seed,
            output.as_ref(),
        ),
        Commands::Targets { image, rate } => print_targets(&image, rate),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_targets(image: &ImageArgs, rate: (f64, Option<f64>)) -> Result<(), Box<dyn std::error::Error>> {
    let targets = layer_targets_from_rates(image.layers, image.pixels(), rate.0, rate.1)?;
    for (l, target) in targets.iter().enumerate() {
        if *target == 0 {
            println!("layer {l}: unconstrained");
        } else {
            println!("layer {l}: {target} bytes");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    image: &ImageArgs,
    levels: u8,
    precinct_exponent: u8,
    rate: Option<(f64, Option<f64>)>,
    slopes: Option<Vec<u16>>,
    tolerance: f64,
    order: ProgressionOrder,
    flush_period: usize,
    seed: u64,
    output: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = match (rate, slopes) {
        (Some((max, min)), _) => LayerSpec::Sizes(layer_targets_from_rates(image.layers, image.pixels(), max, min)?),
        (None, Some(slopes)) => LayerSpec::Slopes(slopes),
        (None, None) => {
            let mut slopes = vec![0; image.layers as usize];
            for (l, slope) in slopes.iter_mut().enumerate().rev().skip(1) {
                *slope = ((image.layers as usize - 1 - l) * 4096).min(u16::MAX as usize) as u16;
            }
            LayerSpec::Slopes(slopes)
        }
    };

    let component = ComponentParams::new(1, 1, levels).with_precincts(vec![(precinct_exponent, precinct_exponent)]);
    let params = CodestreamParams::single_tile(
        image.width,
        image.height,
        vec![component; image.components as usize],
        image.layers,
        order,
    );
    let config = RateControlConfig {
        tolerance: tolerance / 100.0,
        ..RateControlConfig::default()
    };
    let shared = SharedCodestream::new(&params, spec, config)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let rows = precinct_rows(&shared);
    let submitter = shared.submitter();

    let mut tile_parts: Vec<TilePart> = Vec::new();
    let mut layers: Vec<LayerResult> = Vec::new();

    if flush_period == 0 {
        for row in &rows {
            for (precinct, grid) in row {
                submitter.submit(*precinct, synthesize(&mut rng, *grid, precinct.resolution, levels)?)?;
            }
        }
        let out = shared.finish_sequential()?;
        tile_parts = out.tile_parts;
        layers = out.layers;
    } else {
        for chunk in rows.chunks(flush_period) {
            for (precinct, grid) in chunk.iter().flatten() {
                submitter.submit(*precinct, synthesize(&mut rng, *grid, precinct.resolution, levels)?)?;
            }
            if let FlushOutcome::Flushed { tile_parts: parts, layers: flushed } = shared.try_flush()? {
                tile_parts.extend(parts);
                if !flushed.is_empty() {
                    layers = flushed;
                }
            }
        }
        loop {
            match shared.try_flush()? {
                FlushOutcome::Flushed { tile_parts: parts, layers: flushed } => {
                    let progressed = !parts.is_empty();
                    tile_parts.extend(parts);
                    if !flushed.is_empty() {
                        layers = flushed;
                    }
                    if !progressed {
                        break;
                    }
                }
                FlushOutcome::Complete | FlushOutcome::Deferred => break,
            }
        }
    }

    let total: usize = tile_parts.iter().map(|tp| tp.bytes.len()).sum();
    println!(
        "{}x{}, {} components, {} levels, {} order",
        image.width, image.height, image.components, levels, order
    );
    for layer in &layers {
        let target = layer
            .target_bytes
            .map_or_else(|| "-".to_string(), |t| t.to_string());
        println!(
            "layer {:>2}: threshold {:>5}  target {:>10}  bytes {:>10}",
            layer.layer, layer.threshold, target, layer.cumulative_bytes
        );
    }
    println!(
        "{} tile-parts, {} bytes, {:.3} bits/pixel",
        tile_parts.len(),
        total,
        total as f64 * 8.0 / image.pixels() as f64
    );
    if !shared.lock().is_complete() {
        eprintln!("warning: progression did not emit every packet");
    }

    if let Some(path) = output {
        let bytes: Vec<u8> = tile_parts.iter().flat_map(|tp| tp.bytes.iter().copied()).collect();
        fs::write(path, &bytes)?;
        println!("✓ Wrote tile-parts to {:?}", path);
    }
    Ok(())
}

/// Precincts grouped by the reference-grid row where they end, top to
/// bottom, so flushing after each group follows the image in stripes.
fn precinct_rows(shared: &SharedCodestream) -> Vec<Vec<(PrecinctRef, (usize, usize))>> {
    let ctx = shared.lock();
    let mut keyed = Vec::new();
    for tile in ctx.tiles() {
        for comp in &tile.components {
            for res in &comp.resolutions {
                for i in 0..res.num_precincts() {
                    let rect = res.precinct_rect(i);
                    let shift = comp.levels - res.index;
                    let bottom = ((rect.y1 as u64) << shift) * comp.dy as u64;
                    let (w, h) = if res.index == 0 {
                        (rect.width(), rect.height())
                    } else {
                        (rect.width().div_ceil(2), rect.height().div_ceil(2))
                    };
                    let grid = (w.div_ceil(32).max(1) as usize, h.div_ceil(32).max(1) as usize);
                    keyed.push((bottom, PrecinctRef::new(tile.index, comp.index, res.index as usize, i), grid));
                }
            }
        }
    }
    keyed.sort_by_key(|(bottom, precinct, _)| (*bottom, *precinct));

    let mut rows: Vec<Vec<(PrecinctRef, (usize, usize))>> = Vec::new();
    let mut current = None;
    for (bottom, precinct, grid) in keyed {
        if current != Some(bottom) {
            rows.push(Vec::new());
            current = Some(bottom);
        }
        if let Some(row) = rows.last_mut() {
            row.push((precinct, grid));
        }
    }
    rows
}

/// Random truncation tables with steeper slopes at low resolutions.
fn synthesize(
    rng: &mut StdRng,
    grid: (usize, usize),
    resolution: usize,
    levels: u8,
) -> Result<Vec<SubbandBlocks>, j2k_pcrd::PcrdError> {
    let depth = (levels as usize).saturating_sub(resolution) as u16;
    SubbandOrientation::for_resolution(resolution)
        .iter()
        .map(|&orientation| {
            let blocks = (0..grid.0 * grid.1)
                .map(|_| {
                    let passes = rng.random_range(4..=30);
                    let mut slope = 30000u16
                        .saturating_add(depth.saturating_mul(3000))
                        .saturating_add(rng.random_range(0..4000));
                    let mut length = 0u32;
                    let mut pairs = vec![(0, 0)];
                    for _ in 0..passes {
                        length += rng.random_range(1..=40);
                        slope = slope.saturating_sub(rng.random_range(200..=1500)).max(1);
                        if pairs.last().is_some_and(|&(_, s)| s != 0 && s <= slope) {
                            break;
                        }
                        pairs.push((length, slope));
                    }
                    CodeBlock::from_pairs(&pairs, rng.random_range(0..4))
                })
                .collect::<Result<Vec<_>, _>>()?;
            SubbandBlocks::new(orientation, grid.0, grid.1, blocks)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_deep_decompositions() {
        let mut rng = StdRng::seed_from_u64(7);
        for levels in [11u8, 12, 20, 32] {
            let subbands = synthesize(&mut rng, (2, 2), 0, levels).unwrap();
            assert_eq!(subbands.len(), 1);
            let subbands = synthesize(&mut rng, (1, 1), levels as usize, levels).unwrap();
            assert_eq!(subbands.len(), 3);
        }
    }
}
