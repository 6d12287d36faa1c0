mod app_dir;
mod preferences;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use mandeltile_core::{Complex, Mandelbrot, PlaneMapping};
use mandeltile_render::{
    builtin_palettes, export_png, Assembled, AssemblyCancel, ControllerConfig, ExportMetadata,
    ViewSnapshot, ViewportController, INTERESTING_PLACES,
};

use preferences::AppPreferences;

/// How often the watchdog reports assembly progress.
const PROGRESS_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "mandeltile", version, about = "Tiled Mandelbrot renderer")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a region of the plane and write it as a PNG.
    Export(ExportArgs),
    /// Render the viewport, wait for every visible tile, and write a snapshot.
    Snapshot(SnapshotArgs),
    /// Restore a snapshot, capture the viewport, and write it as a PNG.
    Resume(ResumeArgs),
    /// List the built-in interesting places.
    Places,
}

#[derive(Args, Debug)]
struct ViewArgs {
    /// Interesting place to start from (see `places`).
    #[arg(long, conflicts_with_all = ["re", "im"])]
    place: Option<usize>,

    /// Real part of the view center.
    #[arg(long, allow_hyphen_values = true, requires = "im")]
    re: Option<f64>,

    /// Imaginary part of the view center.
    #[arg(long, allow_hyphen_values = true, requires = "re")]
    im: Option<f64>,

    /// Zoom level; overrides the place's own level.
    #[arg(long)]
    level: Option<u32>,

    /// Viewport width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Palette index (see `places` for the list).
    #[arg(long)]
    palette: Option<usize>,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    view: ViewArgs,

    /// Output PNG path. Defaults to the export directory from preferences.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    #[command(flatten)]
    view: ViewArgs,

    /// Output snapshot JSON path.
    #[arg(long)]
    out: PathBuf,

    /// Write tile records without pixel payloads.
    #[arg(long, default_value_t = false)]
    no_pixels: bool,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    /// Snapshot JSON written by `snapshot`.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    /// Viewport width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let prefs = AppPreferences::load();
    if !preferences::config_path().exists() {
        prefs.save();
    }

    match cli.cmd {
        Command::Export(args) => cmd_export(&prefs, args),
        Command::Snapshot(args) => cmd_snapshot(&prefs, args),
        Command::Resume(args) => cmd_resume(&prefs, args),
        Command::Places => {
            cmd_places();
            Ok(())
        }
    }
}

fn cmd_export(prefs: &AppPreferences, args: ExportArgs) -> anyhow::Result<()> {
    let (controller, palette_name) = open_view(prefs, &args.view)?;
    let assembler = controller.assembler();
    let (width, height) = controller.size();
    let assembled = with_watchdog(args.view.timeout, |cancel| {
        assembler.assemble_centered(width, height, cancel)
    })?;

    let out = match args.out {
        Some(out) => out,
        None => default_export_path(prefs, &assembled),
    };
    write_png(&assembled, &out, &palette_name)?;
    log_stats(&controller);
    Ok(())
}

fn cmd_snapshot(prefs: &AppPreferences, args: SnapshotArgs) -> anyhow::Result<()> {
    let (controller, _) = open_view(prefs, &args.view)?;
    let assembler = controller.assembler();
    // Capturing waits until every visible tile holds its final image.
    with_watchdog(args.view.timeout, |cancel| assembler.capture(cancel))?;

    let snapshot = controller.snapshot(!args.no_pixels);
    let json = snapshot.to_json().context("serializing snapshot")?;
    ensure_parent(&args.out)?;
    fs::write(&args.out, json)
        .with_context(|| format!("writing snapshot to {}", args.out.display()))?;
    info!(
        path = %args.out.display(),
        tiles = snapshot.tiles.len(),
        status = %controller.status(),
        "snapshot written"
    );
    log_stats(&controller);
    Ok(())
}

fn cmd_resume(prefs: &AppPreferences, args: ResumeArgs) -> anyhow::Result<()> {
    let json = fs::read_to_string(&args.in_path)
        .with_context(|| format!("reading snapshot {}", args.in_path.display()))?;
    let snapshot = ViewSnapshot::from_json(&json)
        .with_context(|| format!("parsing snapshot {}", args.in_path.display()))?;

    let width = args.width.unwrap_or(prefs.view_width);
    let height = args.height.unwrap_or(prefs.view_height);
    let controller = new_controller(prefs.controller.clone(), width, height)?;
    controller
        .restore(&snapshot)
        .context("restoring snapshot")?;
    info!(status = %controller.status(), "resumed");

    let assembler = controller.assembler();
    let assembled = with_watchdog(args.timeout, |cancel| assembler.capture(cancel))?;
    write_png(&assembled, &args.out, &palette_name(&prefs.controller))?;
    log_stats(&controller);
    Ok(())
}

fn cmd_places() {
    println!("Interesting places:");
    for (index, place) in INTERESTING_PLACES.iter().enumerate() {
        println!(
            "  {index}: {:<20} c = {:+.6} {:+.6}i  level {}",
            place.name, place.center.re, place.center.im, place.level
        );
    }
    println!("Palettes:");
    for (index, palette) in builtin_palettes().iter().enumerate() {
        println!("  {index}: {}", palette.name);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_controller(
    config: ControllerConfig,
    width: u32,
    height: u32,
) -> anyhow::Result<ViewportController> {
    ViewportController::new(
        config,
        PlaneMapping::default(),
        Arc::new(Mandelbrot),
        width,
        height,
    )
    .context("starting render worker")
}

/// Build a controller positioned according to the view arguments. Returns the
/// controller and the name of the palette it colors with.
fn open_view(
    prefs: &AppPreferences,
    args: &ViewArgs,
) -> anyhow::Result<(ViewportController, String)> {
    let mut config = prefs.controller.clone();
    if let Some(index) = args.palette {
        let count = builtin_palettes().len();
        if index >= count {
            bail!("palette index {index} out of range (0..{count})");
        }
        config.worker.palette_index = index;
    }
    let palette = palette_name(&config);

    let width = args.width.unwrap_or(prefs.view_width);
    let height = args.height.unwrap_or(prefs.view_height);
    if width == 0 || height == 0 {
        bail!("viewport must be non-empty, got {width}x{height}");
    }
    let mut controller = new_controller(config, width, height)?;

    match (args.re, args.im) {
        (Some(re), Some(im)) => {
            controller
                .jump_to(Complex::new(re, im), args.level.unwrap_or(0))
                .context("setting zoom level")?;
        }
        _ => {
            let index = args.place.unwrap_or(prefs.default_place);
            let place = controller.jump_to_interesting_place(index).with_context(|| {
                format!(
                    "no interesting place {index} (0..{})",
                    INTERESTING_PLACES.len()
                )
            })?;
            if let Some(level) = args.level {
                controller
                    .jump_to(place.center, level)
                    .context("setting zoom level")?;
            }
        }
    }
    info!(status = %controller.status(), width, height, palette = %palette, "view ready");
    Ok((controller, palette))
}

fn palette_name(config: &ControllerConfig) -> String {
    let palettes = builtin_palettes();
    palettes
        .get(config.worker.palette_index)
        .or_else(|| palettes.first())
        .map(|p| p.name.to_string())
        .unwrap_or_default()
}

/// Run an assembly while a watchdog thread reports progress and cancels it
/// once `timeout_secs` have elapsed.
fn with_watchdog<F>(timeout_secs: u64, assemble: F) -> anyhow::Result<Assembled>
where
    F: FnOnce(&AssemblyCancel) -> mandeltile_render::Result<Assembled>,
{
    let cancel = AssemblyCancel::new();
    let finished = AtomicBool::new(false);
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    let result = thread::scope(|s| {
        s.spawn(|| {
            let mut last_report = Instant::now();
            while !finished.load(Ordering::Acquire) {
                if Instant::now() >= deadline {
                    warn!(timeout_secs, "assembly timed out, cancelling");
                    cancel.cancel();
                    return;
                }
                if last_report.elapsed() >= PROGRESS_PERIOD {
                    let (done, total) = cancel.progress();
                    info!(done, total, "assembling");
                    last_report = Instant::now();
                }
                thread::sleep(Duration::from_millis(20));
            }
        });
        let result = assemble(&cancel);
        finished.store(true, Ordering::Release);
        result
    });
    result.context("assembling image")
}

fn default_export_path(prefs: &AppPreferences, assembled: &Assembled) -> PathBuf {
    let dir = app_dir::resolve_export_dir(&prefs.export_dir);
    dir.join(format!(
        "mandeltile_x{}_{:.6}_{:.6}.png",
        assembled.level, assembled.center.re, assembled.center.im
    ))
}

fn write_png(assembled: &Assembled, out: &Path, palette_name: &str) -> anyhow::Result<()> {
    ensure_parent(out)?;
    let metadata = ExportMetadata::from_assembled(assembled, palette_name);
    export_png(&assembled.image, out, &metadata)
        .with_context(|| format!("writing PNG to {}", out.display()))?;
    info!(
        path = %out.display(),
        width = assembled.image.width(),
        height = assembled.image.height(),
        tiles = assembled.tiles,
        elapsed_ms = assembled.elapsed.as_secs_f64() * 1000.0,
        "exported image"
    );
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    Ok(())
}

fn log_stats(controller: &ViewportController) {
    let stats = controller.stats();
    info!(
        computed = stats.computed,
        mirrored = stats.mirrored,
        zoomed = stats.zoomed,
        evicted = stats.evicted,
        allocation_failures = stats.allocation_failures,
        given_up = stats.given_up,
        panics = stats.panics,
        resident = stats.resident,
        "worker stats"
    );
}
