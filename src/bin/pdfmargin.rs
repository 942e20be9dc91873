//! CLI binary for pdfmargin.
//!
//! A thin presentation layer over the wizard controller: flags become
//! wizard events, published snapshots become terminal output.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdfmargin::{
    inspect, Edge, EdgeInsets, Job, MarginConfig, Notification, ProgressCallback, Stage,
    WizardController, WizardEvent,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// One progress bar per stage. Pages may complete out of order.
struct CliProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                f(bar);
            }
        }
    }
}

impl ProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total_pages as u64);
        bar.set_style(style);
        bar.set_prefix(match stage {
            Stage::Rasterize => "Rasterising",
            Stage::Compose => "Composing",
        });
        bar.enable_steady_tick(Duration::from_millis(80));

        if let Ok(mut slot) = self.bar.lock() {
            if let Some(previous) = slot.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_page_complete(&self, _stage: Stage, _page_num: usize, _total_pages: usize) {
        self.with_bar(|bar| bar.inc(1));
    }

    fn on_page_error(&self, _stage: Stage, page_num: usize, total_pages: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.with_bar(|bar| {
            bar.println(format!(
                "  {} Page {:>3}/{:<3}  {}",
                red("✗"),
                page_num,
                total_pages,
                red(&msg)
            ));
            bar.inc(1);
        });
    }

    fn on_stage_complete(&self, stage: Stage, total_pages: usize, success_count: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
        let failed = total_pages.saturating_sub(success_count);
        if failed == 0 {
            eprintln!(
                "{} {}: {} pages",
                green("✔"),
                stage,
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}: {}/{} pages  ({} failed)",
                red("✘"),
                stage,
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # 20 pt of margin on every side, output named after the input
  pdfmargin --top 20 --bottom 20 --left 20 --right 20 scan.pdf

  # Millimetres, explicit output name
  pdfmargin --unit mm --left 25 --right 10 -o bound-copy thesis.pdf

  # Page count only
  pdfmargin --inspect-only scan.pdf

  # JSON job summary for scripting
  pdfmargin --json --top 10 scan.pdf > result.json

UNITS:
  px  one raster pixel, drawn as one PDF point (default)
  mm  converted at the rendering DPI: round(mm / 25.4 * dpi)

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  PDFMARGIN_CACHE_DIR     Where composed PDFs are written
  RUST_LOG                Overrides the log filter
"#;

/// Add blank margins around every page of a PDF.
#[derive(Parser, Debug)]
#[command(
    name = "pdfmargin",
    version,
    about = "Add blank margins around every page of a PDF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source PDF file.
    input: PathBuf,

    /// Top margin.
    #[arg(long, env = "PDFMARGIN_TOP", default_value_t = 0.0)]
    top: f32,

    /// Bottom margin.
    #[arg(long, env = "PDFMARGIN_BOTTOM", default_value_t = 0.0)]
    bottom: f32,

    /// Left (start) margin.
    #[arg(long, env = "PDFMARGIN_LEFT", default_value_t = 0.0)]
    left: f32,

    /// Right (end) margin.
    #[arg(long, env = "PDFMARGIN_RIGHT", default_value_t = 0.0)]
    right: f32,

    /// Unit of the margin values.
    #[arg(long, env = "PDFMARGIN_UNIT", value_enum, default_value = "px")]
    unit: UnitArg,

    /// Output name without extension. Defaults to the input's name.
    #[arg(short = 'o', long, env = "PDFMARGIN_OUTPUT_NAME")]
    output_name: Option<String>,

    /// Rendering DPI (36–400).
    #[arg(long, env = "PDFMARGIN_DPI", default_value_t = 72,
          value_parser = clap::value_parser!(u32).range(36..=400))]
    dpi: u32,

    /// Directory the composed PDF is written to.
    #[arg(long, env = "PDFMARGIN_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Provider authority for content:// URIs.
    #[arg(long, env = "PDFMARGIN_AUTHORITY")]
    authority: Option<String>,

    /// Pages processed concurrently.
    #[arg(short, long, env = "PDFMARGIN_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Minimum busy time for compose, in milliseconds.
    #[arg(long, env = "PDFMARGIN_MIN_BUSY_MS", default_value_t = 0)]
    min_busy_ms: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFMARGIN_PASSWORD")]
    password: Option<String>,

    /// Print the final job summary as JSON.
    #[arg(long, env = "PDFMARGIN_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "PDFMARGIN_NO_PROGRESS")]
    no_progress: bool,

    /// Print page count and names only.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFMARGIN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFMARGIN_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum UnitArg {
    Px,
    Mm,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress.clone())?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let info = inspect(cli.input.as_path(), &config)
            .await
            .context("Failed to inspect PDF")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialize info")?
            );
        } else {
            println!("File:   {}", cli.input.display());
            println!("Pages:  {}", info.page_count);
            println!("Size:   {} bytes", info.size_bytes);
            if let Some(ref name) = info.display_name {
                println!("Name:   {}", name);
            }
        }
        return Ok(());
    }

    // ── Drive the wizard ─────────────────────────────────────────────────
    let insets = margins_from_cli(&cli, config.dpi);
    let (wizard, mut notifications) = WizardController::with_pdfium(&config);

    wizard
        .dispatch(WizardEvent::SetSource(cli.input.as_path().into()))
        .await?;
    wait_for_step(&wizard, &mut notifications).await?;

    for edge in Edge::ALL {
        let value = match edge {
            Edge::Top => insets.top,
            Edge::Bottom => insets.bottom,
            Edge::Left => insets.left,
            Edge::Right => insets.right,
        };
        wizard.dispatch(WizardEvent::SetMargin(edge, value)).await?;
    }
    if let Some(ref name) = cli.output_name {
        wizard
            .dispatch(WizardEvent::SetOutputName(name.clone()))
            .await?;
    }

    wizard.dispatch(WizardEvent::StartCompose).await?;
    let job = wait_for_step(&wizard, &mut notifications).await?;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&job.summary()).context("Failed to serialize job")?
        );
    } else if let Some(ref out) = job.result {
        if !cli.quiet {
            eprintln!(
                "{} Wrote {}  {}",
                green("✔"),
                bold(&out.path.display().to_string()),
                dim(&format!("{} pages, {} bytes", out.page_count, out.size_bytes))
            );
        }
        println!("{}", out.uri);
    }

    if let Some(ref cb) = progress {
        let failed = cb.errors.load(Ordering::SeqCst);
        if failed > 0 {
            bail!("{} page(s) failed", failed);
        }
    }
    Ok(())
}

/// Wait for the in-flight step to settle and turn failure notifications
/// into errors.
async fn wait_for_step(
    wizard: &WizardController,
    notifications: &mut UnboundedReceiver<Notification>,
) -> Result<Job> {
    let job = wizard.wait_until_idle().await?;
    while let Ok(notification) = notifications.try_recv() {
        match notification {
            Notification::SourceUnreadable(reason) => {
                bail!("Could not open source PDF: {}", reason)
            }
            Notification::ComposeFailed(reason) => bail!("Compose failed: {}", reason),
            Notification::OutputNameMissing => {
                bail!("No output name: the input has no usable name, pass -o/--output-name")
            }
            Notification::ComposeSucceeded(_) => {}
        }
    }
    Ok(job)
}

fn margins_from_cli(cli: &Cli, dpi: u32) -> EdgeInsets {
    match cli.unit {
        UnitArg::Mm => EdgeInsets::from_millimetres(cli.top, cli.bottom, cli.left, cli.right, dpi),
        UnitArg::Px => {
            let px = |v: f32| v.max(0.0).round().min(u32::MAX as f32) as u32;
            EdgeInsets::new(px(cli.top), px(cli.bottom), px(cli.left), px(cli.right))
        }
    }
}

fn build_config(cli: &Cli, progress: Option<Arc<CliProgressCallback>>) -> Result<MarginConfig> {
    let mut builder = MarginConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .min_busy_ms(cli.min_busy_ms);
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if let Some(ref authority) = cli.authority {
        builder = builder.share_authority(authority);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}
