//! CLI binary for ordervision.
//!
//! A thin shim over the library crate: loads rendered page images from a
//! directory, runs the extraction pipeline against the Gemini oracle, and
//! writes the result as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ordervision::{
    extract_order, pipeline::encode, DocumentInput, ExtractionConfig, ExtractionProgressCallback,
    GeminiOracle, OracleHandle, PageImage, ProgressCallback,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

/// Extract structured order line items from rendered page images.
#[derive(Parser, Debug)]
#[command(name = "ordervision", version, about)]
struct Cli {
    /// Directory containing the rendered pages (PNG/JPEG), processed in
    /// filename order. A sidecar `<page>.txt` next to an image is used as
    /// that page's text layer.
    pages_dir: PathBuf,

    /// Output JSON file. Prints to stdout when omitted.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Gemini model to query.
    #[arg(long, env = "GEMINI_MODEL", default_value = ordervision::oracle::DEFAULT_GEMINI_MODEL)]
    model: String,

    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Skip the visual layout-classification oracle call.
    #[arg(long)]
    skip_visual: bool,

    /// Maximum oracle retries per page.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Corrective re-extraction budget on low confidence.
    #[arg(long, default_value_t = 1)]
    validation_retries: u32,

    /// Verbose logging (-v: info, -vv: debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ── Terminal progress callback ───────────────────────────────────────────────

struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos:>3}/{len} pages  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ExtractionProgressCallback for CliProgress {
    fn on_extraction_start(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting extraction of {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, products: usize, quality: f64) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{products} products")),
            dim(&format!("quality {quality:.2}")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: String) {
        let msg = if error.len() > 80 {
            format!("{}\u{2026}", &error[..79])
        } else {
            error
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page_num,
            total,
            dim(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_strategy_change(&self, page_num: usize, from: &str, to: &str) {
        self.bar.println(format!(
            "  {} Page {page_num}: strategy {from} → {to}",
            cyan("↻"),
        ));
    }

    fn on_extraction_complete(&self, _total: usize, products: usize) {
        self.bar.finish_with_message(format!("{products} products"));
    }
}

// ── Page loading ─────────────────────────────────────────────────────────────

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

fn load_pages(dir: &PathBuf) -> Result<Vec<PageImage>> {
    let mut image_paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read directory '{}'", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .collect();
    image_paths.sort();

    if image_paths.is_empty() {
        bail!(
            "no page images (png/jpg) found in '{}' — render the document first",
            dir.display()
        );
    }

    let mut pages = Vec::with_capacity(image_paths.len());
    for (index, path) in image_paths.iter().enumerate() {
        let img = image::open(path)
            .with_context(|| format!("cannot open image '{}'", path.display()))?;
        let encoded = encode::encode_page(&img)
            .with_context(|| format!("cannot encode image '{}'", path.display()))?;

        let mut page = PageImage::new(index, encoded);
        let sidecar = path.with_extension("txt");
        if sidecar.exists() {
            if let Ok(text) = std::fs::read_to_string(&sidecar) {
                page = page.with_text(text);
            }
        }
        pages.push(page);
    }
    Ok(pages)
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "ordervision=info",
        _ => "ordervision=debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let pages = load_pages(&cli.pages_dir)?;
    let doc = DocumentInput::new(pages);

    let oracle: OracleHandle = Arc::new(GeminiOracle::new(cli.api_key, cli.model));

    let progress: ProgressCallback = CliProgress::new();
    let config = ExtractionConfig::builder()
        .max_retries(cli.max_retries)
        .max_validation_retries(cli.validation_retries)
        .skip_visual_analysis(cli.skip_visual)
        .progress_callback(progress)
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let output = extract_order(&doc, &oracle, &config)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    // Summary to stderr, data to file/stdout.
    eprintln!(
        "\n{} {} products · confidence {:.1} ({:?}) · strategy {} · {} adaptations",
        green("●"),
        output.products.len(),
        output.validation.average_confidence,
        output.validation.level,
        output.metadata.final_strategy,
        output.metadata.strategy_adaptations,
    );
    if !output.metadata.failed_pages.is_empty() {
        eprintln!(
            "{} failed pages: {:?}",
            red("●"),
            output.metadata.failed_pages
        );
    }

    let json = serde_json::to_string_pretty(&output.to_job_value())?;
    match &cli.out {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("cannot write '{}'", path.display()))?;
            eprintln!("{} saved to {}", green("●"), path.display());
        }
        None => println!("{json}"),
    }

    Ok(())
}
