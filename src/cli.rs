// ============================================================================
// patchfill CLI — headless batch content-aware fill
// ============================================================================
//
// Usage examples:
//   patchfill --input photo.png --mask hole.png --output result.png
//   patchfill -i photo.jpg -m hole.png -o out.jpg --quality 85
//   patchfill -i "shots/*.png" -m hole.png --output-dir filled/
//   patchfill -i photo.png -m hole.png -o out.png --debug-dir steps/ -v
//
// All processing runs synchronously; worker threads are only used inside
// the wavefront refinement pass.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::io::{load_mask, load_rgba, save_rgba};
use crate::nnf::PatchParams;
use crate::removal::{RemovalParams, remove_object};
use crate::{log_err, log_info};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// patchfill headless object remover.
///
/// Fill masked image regions with surrounding content — no GUI required.
#[derive(Parser, Debug)]
#[command(
    name = "patchfill",
    about = "patchfill headless content-aware fill",
    long_about = "Remove objects from images by synthesizing the masked region\n\
                  from the rest of the picture (PatchMatch + bidirectional\n\
                  similarity).  The mask is a grayscale image of the input's\n\
                  size; bright pixels mark what to remove.\n\n\
                  Example:\n  \
                  patchfill --input photo.png --mask hole.png --output result.png\n  \
                  patchfill -i \"shots/*.jpg\" -m hole.png --output-dir filled/"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Grayscale mask marking the region to remove (bright = remove).
    /// Must match the input dimensions.
    #[arg(short, long, value_name = "MASK.png")]
    pub mask: PathBuf,

    /// Output file path. Only valid for single-file input.
    /// For batch input use --output-dir instead.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    /// Files are written here as "<stem>_filled.png".
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Patch window side (odd, 3-11).
    #[arg(long, default_value_t = 7, value_name = "N")]
    pub patch_size: i32,

    /// Synthesis iterations at the finest level; coarser levels run more.
    #[arg(long, default_value_t = 2, value_name = "N")]
    pub iterations: u32,

    /// Inner NNF refinement passes per synthesis iteration.
    #[arg(long, default_value_t = 2, value_name = "N")]
    pub nnf_iterations: u32,

    /// Completeness/coherence balance in [0, 1].
    #[arg(long, default_value_t = 0.5, value_name = "0-1")]
    pub alpha: f32,

    /// Skip this many of the coarsest pyramid levels.
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub lod_bias: usize,

    /// Worker threads for the parallel refinement pass (0 = all cores).
    #[arg(short, long, default_value_t = 0, value_name = "N")]
    pub threads: usize,

    /// PRNG seed for the randomized search.
    #[arg(long, default_value_t = 0, value_name = "SEED")]
    pub seed: u64,

    /// JPEG quality (1-100, default 90).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Directory for intermediate snapshots and offset-field dumps.
    #[arg(long, value_name = "DIR")]
    pub debug_dir: Option<PathBuf>,

    /// Print per-file timing and progress information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    if args.patch_size < 3 || args.patch_size > 11 || args.patch_size % 2 == 0 {
        eprintln!(
            "error: --patch-size must be odd and within 3-11, got {}.",
            args.patch_size
        );
        return ExitCode::FAILURE;
    }
    if !(0.0..=1.0).contains(&args.alpha) {
        eprintln!("error: --alpha must be within [0, 1], got {}.", args.alpha);
        return ExitCode::FAILURE;
    }

    // Resolve glob patterns / literal paths → concrete PathBufs
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    // Multiple inputs require --output-dir, not --output
    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    // Create output directory if specified
    if let Some(dir) = &args.output_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "error: could not create output directory '{}': {}",
                dir.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    }

    // The mask is shared across the whole batch
    let mask = match load_mask(&args.mask) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let params = RemovalParams {
        lod_bias: args.lod_bias,
        min_iterations: args.iterations,
        iterations_lod_factor: 2,
        min_nnf_iterations: args.nnf_iterations,
        nnf_iterations_lod_factor: 1,
        alpha: args.alpha,
        patch: PatchParams {
            patch_size: args.patch_size,
            seed: args.seed,
            ..PatchParams::default()
        },
        threads: args.threads,
        debug_dir: args.debug_dir.clone(),
    };

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!(
                "[{}/{}] {}",
                idx + 1,
                total,
                input_path.display()
            );
        }
        let started = Instant::now();
        match process_one(input_path, &mask, &params, &args) {
            Ok(out_path) => {
                log_info!("filled '{}' -> '{}'", input_path.display(), out_path.display());
                if args.verbose {
                    println!(
                        "  -> {} ({:.2}s)",
                        out_path.display(),
                        started.elapsed().as_secs_f32()
                    );
                }
            }
            Err(e) => {
                any_failure = true;
                log_err!("'{}': {}", input_path.display(), e);
                eprintln!("error: {}: {}", input_path.display(), e);
            }
        }
    }

    if any_failure {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn process_one(
    input: &Path,
    mask: &image::GrayImage,
    params: &RemovalParams,
    args: &CliArgs,
) -> Result<PathBuf, String> {
    let img = load_rgba(input)?;
    let verbose = args.verbose;
    let mut progress = |_: &image::RgbaImage, done: usize, total: usize| {
        if verbose {
            println!("  level {}/{}", done, total);
        }
    };
    let result = remove_object(&img, mask, params, Some(&mut progress))?;
    let out_path = output_path_for(input, args)?;
    save_rgba(&out_path, &result, args.quality)?;
    Ok(out_path)
}

fn output_path_for(input: &Path, args: &CliArgs) -> Result<PathBuf, String> {
    if let Some(dir) = &args.output_dir {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        return Ok(dir.join(format!("{}_filled.png", stem)));
    }
    if let Some(out) = &args.output {
        return Ok(out.clone());
    }
    // Neither given: write next to the input.
    Ok(input.with_extension("filled.png"))
}

/// Expand glob patterns and literal paths into an ordered, de-duplicated
/// file list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        if let Ok(entries) = glob::glob(pattern) {
            for path in entries.flatten() {
                if path.is_file() {
                    matched = true;
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
            }
        }
        // A literal path with no glob match still counts (error surfaces at
        // load time with a proper message).
        if !matched {
            let literal = PathBuf::from(pattern);
            if !out.contains(&literal) {
                out.push(literal);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs::parse_from(["patchfill", "-i", "in.png", "-m", "mask.png"])
    }

    #[test]
    fn output_path_prefers_explicit_file() {
        let mut args = base_args();
        args.output = Some(PathBuf::from("result.jpg"));
        let p = output_path_for(Path::new("photo.png"), &args).unwrap();
        assert_eq!(p, PathBuf::from("result.jpg"));
    }

    #[test]
    fn output_dir_uses_input_stem() {
        let mut args = base_args();
        args.output_dir = Some(PathBuf::from("out"));
        let p = output_path_for(Path::new("shots/photo.png"), &args).unwrap();
        assert_eq!(p, PathBuf::from("out/photo_filled.png"));
    }

    #[test]
    fn defaults_parse() {
        let args = base_args();
        assert_eq!(args.patch_size, 7);
        assert_eq!(args.alpha, 0.5);
        assert_eq!(args.threads, 0);
        assert!(!args.verbose);
    }
}
