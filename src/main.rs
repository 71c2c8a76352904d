use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use env_logger;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use anyhow::{bail, Context, Result};

use image::DynamicImage;
use ndarray::{s, Array3};

#[derive(Parser, Debug)]
#[command(name = "training-data-preprocessing-roads", version = "0.1.0")]
struct Args {
    /// Path to root directory containing split subfolders
    #[arg(long, default_value = "./data/mnih")]
    data_dir: String,

    /// Output directory for extracted patches and manifests
    #[arg(long, default_value = "./patch_output")]
    save_dir: String,

    /// Patch size in pixels, either `S` (square) or `H,W`
    #[arg(long, default_value = "512", value_parser = parse_patch_size)]
    patch_size: (usize, usize),

    /// Pixels padded around each tile before gridding, one value or `top,bottom,left,right`
    #[arg(long, default_value = "0", value_parser = parse_pad)]
    pad: Pad,

    /// Overlapping pixels between two adjacent patches in both vertical and horizontal direction
    #[arg(long, default_value = "0")]
    overlap: usize,

    /// Comma-separated split names to process
    #[arg(long, default_value = "train,valid", value_delimiter = ',')]
    splits: Vec<String>,

    /// Subfolder holding source imagery tiles within each split
    #[arg(long, default_value = "sat")]
    image_subdir: String,

    /// File extension of source imagery tiles
    #[arg(long, default_value = "tiff")]
    image_ext: String,

    /// Subfolder holding ground-truth mask tiles within each split
    #[arg(long, default_value = "map")]
    mask_subdir: String,

    /// File extension of ground-truth mask tiles
    #[arg(long, default_value = "tif")]
    mask_ext: String,

    /// Divisor remapping raw mask intensities to class labels (255 => road pixels become 1)
    #[arg(long, default_value = "255")]
    mask_divisor: u8,
}

// Encoded patch extensions, matching the manifest the training side consumes
const IMAGE_PATCH_EXT: &str = "jpg";
const MASK_PATCH_EXT: &str = "png";

/// Per-side padding applied to a tile before the grid is planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pad {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

impl Pad {
    fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }

    fn total_h(&self) -> usize {
        self.top + self.bottom
    }

    fn total_w(&self) -> usize {
        self.left + self.right
    }
}

/// Parse `--pad` as either one symmetric value or four `top,bottom,left,right` values.
fn parse_pad(s: &str) -> Result<Pad, String> {
    let values = parse_usize_list(s)?;
    match values[..] {
        [all] => Ok(Pad { top: all, bottom: all, left: all, right: all }),
        [top, bottom, left, right] => Ok(Pad { top, bottom, left, right }),
        _ => Err(format!(
            "pad takes one value or four comma-separated values, got {}",
            values.len()
        )),
    }
}

/// Parse `--patch-size` as `S` (square) or `H,W`, both positive.
fn parse_patch_size(s: &str) -> Result<(usize, usize), String> {
    let values = parse_usize_list(s)?;
    let (h, w) = match values[..] {
        [side] => (side, side),
        [h, w] => (h, w),
        _ => {
            return Err(format!(
                "patch size takes one value or two comma-separated values, got {}",
                values.len()
            ))
        }
    };
    if h == 0 || w == 0 {
        return Err(format!("patch size must be positive, got {}x{}", h, w));
    }
    Ok((h, w))
}

fn parse_usize_list(s: &str) -> Result<Vec<usize>, String> {
    s.split(',')
        .map(str::trim)
        .map(|part| {
            part.parse::<usize>()
                .map_err(|e| format!("invalid value '{}': {}", part, e))
        })
        .collect()
}

/// Reject invalid configuration before any tile is touched.
fn validate_config(args: &Args) -> Result<()> {
    let (ph, pw) = args.patch_size;
    if args.overlap >= ph.min(pw) {
        bail!(
            "overlap {} must be smaller than the patch size {}x{}",
            args.overlap, ph, pw
        );
    }
    if args.mask_divisor == 0 {
        bail!("mask divisor must be at least 1");
    }
    if args.splits.is_empty() {
        bail!("at least one split name is required");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();
    info!("=== training-data-preprocessing-roads start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);

    validate_config(&args)?;

    let data_dir = Path::new(&args.data_dir);
    let save_dir = Path::new(&args.save_dir);
    let patch_dir = save_dir.join("patches");

    info!("Creating output directories under {:?}", save_dir);
    fs::create_dir_all(&patch_dir)
        .with_context(|| format!("Failed to create patch directory {:?}", patch_dir))?;

    for split in &args.splits {
        info!("==== [Split {}] ====", split);
        let summary = process_split(data_dir, save_dir, &patch_dir, split, &args)?;
        info!(
            "[Split {}] => {} tiles patched, {} tiles skipped, {} patches written",
            split, summary.patched, summary.skipped, summary.patches
        );
    }

    info!("=== Done. Check your save_dir for patches and manifests. ===");
    Ok(())
}

/// Walk one axis: regular steps, then a forced final origin covering the trailing edge.
fn axis_positions(extent: usize, patch: usize, step: usize) -> Vec<usize> {
    if extent <= patch {
        // Clipped single origin; callers pad first if they need a full window here.
        return vec![0];
    }
    let mut positions = Vec::new();
    let mut pos = 0;
    while pos + patch <= extent {
        positions.push(pos);
        pos += step;
    }
    let tail = extent - patch;
    if *positions.last().expect("walk collects at least position 0") != tail {
        positions.push(tail);
    }
    positions
}

/// Plan the row-major grid of patch origins over a (possibly padded) extent.
fn make_grid(
    extent: (usize, usize),
    patch_size: (usize, usize),
    overlap: usize,
) -> Result<Vec<(usize, usize)>> {
    let (ph, pw) = patch_size;
    if overlap >= ph.min(pw) {
        bail!(
            "overlap {} must be smaller than the patch size {}x{}",
            overlap, ph, pw
        );
    }
    let rows = axis_positions(extent.0, ph, ph - overlap);
    let cols = axis_positions(extent.1, pw, pw - overlap);
    let mut grid = Vec::with_capacity(rows.len() * cols.len());
    for &y in &rows {
        for &x in &cols {
            grid.push((y, x));
        }
    }
    Ok(grid)
}

/// Zero-fill pad a channel-last tile on each side.
fn pad_tile(tile: Array3<u8>, pad: &Pad) -> Array3<u8> {
    if pad.is_zero() {
        return tile;
    }
    let (h, w, c) = tile.dim();
    let mut out = Array3::zeros((h + pad.total_h(), w + pad.total_w(), c));
    out.slice_mut(s![pad.top..pad.top + h, pad.left..pad.left + w, ..])
        .assign(&tile);
    out
}

/// One cropped (image, mask) pair at grid origin (y, x).
struct PatchPair {
    image: Array3<u8>,
    mask: Array3<u8>,
    y: usize,
    x: usize,
}

/// Lazy patch iterator over one padded tile pair, one item per grid origin.
struct TilePatches {
    image: Array3<u8>,
    mask: Array3<u8>,
    grid: Vec<(usize, usize)>,
    patch_size: (usize, usize),
    next: usize,
}

impl TilePatches {
    /// Crop one (ph, pw) window from both arrays, checking the padded extent.
    fn crop(&self, y: usize, x: usize) -> Result<PatchPair> {
        let (ph, pw) = self.patch_size;
        let (h, w, _) = self.image.dim();
        if y + ph > h || x + pw > w {
            bail!(
                "patch window at y={} x={} ({}x{}) exceeds padded extent {}x{}",
                y, x, ph, pw, h, w
            );
        }
        let image = self.image.slice(s![y..y + ph, x..x + pw, ..]).to_owned();
        let mask = self.mask.slice(s![y..y + ph, x..x + pw, ..]).to_owned();
        Ok(PatchPair { image, mask, y, x })
    }
}

impl Iterator for TilePatches {
    type Item = Result<PatchPair>;

    fn next(&mut self) -> Option<Self::Item> {
        let &(y, x) = self.grid.get(self.next)?;
        self.next += 1;
        Some(self.crop(y, x))
    }
}

/// Pad both tiles, plan the grid over the padded extent and return the patch iterator.
fn patch_tile(
    image: Array3<u8>,
    mask: Array3<u8>,
    patch_size: (usize, usize),
    pad: &Pad,
    overlap: usize,
) -> Result<TilePatches> {
    let (ih, iw, _) = image.dim();
    let (mh, mw, _) = mask.dim();
    if (ih, iw) != (mh, mw) {
        bail!(
            "image/mask extent mismatch: image is {}x{}, mask is {}x{}",
            ih, iw, mh, mw
        );
    }
    let image = pad_tile(image, pad);
    let mask = pad_tile(mask, pad);
    let (h, w, _) = image.dim();
    let grid = make_grid((h, w), patch_size, overlap)?;
    Ok(TilePatches {
        image,
        mask,
        grid,
        patch_size,
        next: 0,
    })
}

/// Divide every mask byte by the label divisor, so raw 255 becomes class 1.
fn remap_mask(mask: &mut Array3<u8>, divisor: u8) {
    if divisor <= 1 {
        return;
    }
    mask.mapv_inplace(|v| v / divisor);
}

/// Decode a source imagery tile into a channel-last (H, W, 3) array.
fn load_image_tile(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path).with_context(|| format!("decoding image tile {:?}", path))?;
    let rgb = img.into_rgb8();
    let (w, h) = rgb.dimensions();
    let arr = Array3::from_shape_vec((h as usize, w as usize, 3), rgb.into_raw())
        .expect("RGB buffer length matches its dimensions");
    Ok(arr)
}

/// Decode a mask tile, keeping its stored band count (1 or 3).
fn load_mask_tile(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path).with_context(|| format!("decoding mask tile {:?}", path))?;
    let arr = match img {
        DynamicImage::ImageLuma8(gray) => {
            let (w, h) = gray.dimensions();
            Array3::from_shape_vec((h as usize, w as usize, 1), gray.into_raw())
                .expect("gray buffer length matches its dimensions")
        }
        DynamicImage::ImageRgb8(rgb) => {
            let (w, h) = rgb.dimensions();
            Array3::from_shape_vec((h as usize, w as usize, 3), rgb.into_raw())
                .expect("RGB buffer length matches its dimensions")
        }
        other => {
            let rgb = other.into_rgb8();
            let (w, h) = rgb.dimensions();
            Array3::from_shape_vec((h as usize, w as usize, 3), rgb.into_raw())
                .expect("RGB buffer length matches its dimensions")
        }
    };
    Ok(arr)
}

/// Encode an image patch as RGB; a write failure here aborts the whole run.
fn save_image_patch(path: &Path, patch: &Array3<u8>) -> Result<()> {
    let (h, w, _) = patch.dim();
    let data = patch
        .as_slice()
        .expect("patch array not contiguous")
        .to_vec();
    let img = image::RgbImage::from_raw(w as u32, h as u32, data)
        .expect("patch buffer length matches its dimensions");
    img.save(path)
        .with_context(|| format!("writing image patch {:?}", path))?;
    Ok(())
}

/// Encode a mask patch with its band count preserved; write failures abort the run.
fn save_mask_patch(path: &Path, patch: &Array3<u8>) -> Result<()> {
    let (h, w, c) = patch.dim();
    let data = patch
        .as_slice()
        .expect("patch array not contiguous")
        .to_vec();
    match c {
        1 => {
            let img = image::GrayImage::from_raw(w as u32, h as u32, data)
                .expect("patch buffer length matches its dimensions");
            img.save(path)
                .with_context(|| format!("writing mask patch {:?}", path))?;
        }
        3 => {
            let img = image::RgbImage::from_raw(w as u32, h as u32, data)
                .expect("patch buffer length matches its dimensions");
            img.save(path)
                .with_context(|| format!("writing mask patch {:?}", path))?;
        }
        other => bail!("unsupported mask band count {} for {:?}", other, path),
    }
    Ok(())
}

/// Patch filename encoding the source tile and its grid origin.
fn patch_file_name(stem: &str, y: usize, x: usize, ext: &str) -> String {
    format!("{}_y{}x{}.{}", stem, y, x, ext)
}

/// Discovered image/mask tile pair, keyed by shared stem.
struct TilePair {
    stem: String,
    image_path: PathBuf,
    mask_path: PathBuf,
}

/// Per-tile outcome: patched with manifest records, or skipped with a reason.
enum TileOutcome {
    Patched(Vec<(String, String)>),
    Skipped(String),
}

struct SplitSummary {
    patched: usize,
    skipped: usize,
    patches: usize,
}

/// Enumerate imagery tiles of one split and resolve their mask counterparts.
///
/// Discovery is imagery-driven and ordered by stem; a tile present in one
/// modality but missing in the other is skipped with a warning.
fn discover_pairs(split_dir: &Path, args: &Args) -> Result<Vec<TilePair>> {
    let image_dir = split_dir.join(&args.image_subdir);
    let mask_dir = split_dir.join(&args.mask_subdir);

    let rd = fs::read_dir(&image_dir)
        .with_context(|| format!("reading image directory {:?}", image_dir))?;

    let mut stems: Vec<(String, PathBuf)> = Vec::new();
    for entry_r in rd {
        let entry = match entry_r {
            Ok(en) => en,
            Err(e) => {
                warn!("Skipping an entry due to read_dir error: {:?}", e);
                continue;
            }
        };
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(OsStr::to_str)
            .map_or(false, |ext| ext.eq_ignore_ascii_case(&args.image_ext));
        if !is_image {
            debug!("Skipping non-imagery file={:?}", path);
            continue;
        }
        match path.file_stem().and_then(OsStr::to_str) {
            Some(stem) => stems.push((stem.to_string(), path.clone())),
            None => warn!("Skipping imagery file with unusable name: {:?}", path),
        }
    }
    stems.sort();

    let image_stems: HashSet<String> = stems.iter().map(|(stem, _)| stem.clone()).collect();

    let mut pairs = Vec::new();
    for (stem, image_path) in stems {
        let mask_path = mask_dir.join(format!("{}.{}", stem, args.mask_ext));
        if mask_path.exists() {
            pairs.push(TilePair {
                stem,
                image_path,
                mask_path,
            });
        } else {
            warn!(
                "tile {} has no mask counterpart at {:?} => skipping",
                stem, mask_path
            );
        }
    }

    // Mask tiles without an imagery counterpart get the same treatment.
    if let Ok(rd) = fs::read_dir(&mask_dir) {
        for entry in rd.flatten() {
            let path = entry.path();
            let is_mask = path
                .extension()
                .and_then(OsStr::to_str)
                .map_or(false, |ext| ext.eq_ignore_ascii_case(&args.mask_ext));
            if !is_mask {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(OsStr::to_str) {
                if !image_stems.contains(stem) {
                    warn!("mask tile {:?} has no imagery counterpart => skipping", path);
                }
            }
        }
    }

    Ok(pairs)
}

/// Extract, remap and persist all patches of one tile pair.
///
/// Decode failures, extent mismatches and out-of-bounds windows are reported
/// as `Skipped` so sibling tiles keep processing; patch write failures are
/// returned as errors and abort the run.
fn process_tile(pair: &TilePair, patch_dir: &Path, args: &Args) -> Result<TileOutcome> {
    debug!("process_tile() start => tile={}", pair.stem);

    let image = match load_image_tile(&pair.image_path) {
        Ok(arr) => arr,
        Err(e) => return Ok(TileOutcome::Skipped(format!("{:#}", e))),
    };
    let mask = match load_mask_tile(&pair.mask_path) {
        Ok(arr) => arr,
        Err(e) => return Ok(TileOutcome::Skipped(format!("{:#}", e))),
    };

    let patches = match patch_tile(image, mask, args.patch_size, &args.pad, args.overlap) {
        Ok(iter) => iter,
        Err(e) => return Ok(TileOutcome::Skipped(format!("{:#}", e))),
    };

    let mut records = Vec::new();
    for item in patches {
        let PatchPair { image, mut mask, y, x } = match item {
            Ok(patch) => patch,
            Err(e) => return Ok(TileOutcome::Skipped(format!("{:#}", e))),
        };
        remap_mask(&mut mask, args.mask_divisor);

        let image_name = patch_file_name(&pair.stem, y, x, IMAGE_PATCH_EXT);
        let mask_name = patch_file_name(&pair.stem, y, x, MASK_PATCH_EXT);
        save_image_patch(&patch_dir.join(&image_name), &image)?;
        save_mask_patch(&patch_dir.join(&mask_name), &mask)?;
        records.push((image_name, mask_name));
    }

    debug!("tile={} => {} patches", pair.stem, records.len());
    Ok(TileOutcome::Patched(records))
}

/// Patch every tile pair of one split and write its manifest.
fn process_split(
    data_dir: &Path,
    save_dir: &Path,
    patch_dir: &Path,
    split: &str,
    args: &Args,
) -> Result<SplitSummary> {
    let split_dir = data_dir.join(split);
    let pairs = discover_pairs(&split_dir, args)?;
    info!("Found {} tile pairs in {:?}", pairs.len(), split_dir);

    let pb = ProgressBar::new(pairs.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
            .unwrap()
            .progress_chars("##-"),
    );

    // Tiles are independent; patch files are written from the workers while
    // manifest lines are collected in discovery order.
    let results: Vec<Result<TileOutcome>> = pairs
        .par_iter()
        .map(|pair| process_tile(pair, patch_dir, args))
        .collect();

    let manifest_path = save_dir.join(format!("file_list_{}.txt", split));
    let manifest = File::create(&manifest_path)
        .with_context(|| format!("creating manifest {:?}", manifest_path))?;
    let mut writer = BufWriter::new(manifest);

    let mut summary = SplitSummary {
        patched: 0,
        skipped: 0,
        patches: 0,
    };
    for (pair, result) in pairs.iter().zip(results) {
        pb.inc(1);
        match result? {
            TileOutcome::Patched(records) => {
                for (image_name, mask_name) in &records {
                    writeln!(writer, "{} {}", image_name, mask_name)
                        .with_context(|| format!("writing manifest {:?}", manifest_path))?;
                }
                summary.patched += 1;
                summary.patches += records.len();
            }
            TileOutcome::Skipped(reason) => {
                warn!("split={}, tile={} skipped => {}", split, pair.stem, reason);
                summary.skipped += 1;
            }
        }
    }
    writer
        .flush()
        .with_context(|| format!("flushing manifest {:?}", manifest_path))?;
    pb.finish_with_message(format!("split {} done", split));

    Ok(summary)
}
