//! CLI binary for edgequake-pdf2table.
//!
//! A thin shim over the library crate: maps CLI flags to
//! `ExtractionConfig`, submits the PDF to an `AppContext`, and drives a
//! progress bar by polling the document's progress record.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_pdf2table::{
    AppContext, DocumentState, ExtractionConfig, GlobalTable, ProgressState,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
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

const POLL_INTERVAL: Duration = Duration::from_millis(250);

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract the tables of a statement, print them as a pipe table
  pdf2table statement.pdf

  # Global table as JSON
  pdf2table --json statement.pdf > rows.json

  # Encrypted PDF, Gemini model, gentler on the quota
  pdf2table --password s3cret --model gemini-2.5-flash --concurrency 1 statement.pdf

  # Keep chunk images and raw model text for debugging
  pdf2table --save-chunk-images --save-raw-chunks --storage ./debug statement.pdf

OUTPUT LAYOUT (under --storage, default ./storage):
  <document_id>/original.pdf
  <document_id>/pages/<N>.png
  <document_id>/tables/page_<N>.json
  <document_id>/tables/global.json
  <document_id>/raw/error.txt          (on failure)

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (preferred when set)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (otherwise the system library)
"#;

/// Extract tables from PDF files using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2table",
    version,
    about = "Extract tables from PDF files using Vision LLMs",
    long_about = "Render each PDF page, cut it into overlapping bands, ask a Vision LLM to \
transcribe each band as delimited rows, and merge the bands into one table per page and one \
table per document.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Write the global table JSON to this file.
    #[arg(short, long, env = "PDF2TABLE_OUTPUT")]
    output: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TABLE_PASSWORD")]
    password: Option<String>,

    /// Directory for per-document artifacts.
    #[arg(long, env = "PDF2TABLE_STORAGE", default_value = "storage")]
    storage: PathBuf,

    /// LLM model ID (e.g. gemini-2.5-flash, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2TABLE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Chunk height in points (1/72 inch).
    #[arg(long, env = "PDF2TABLE_CHUNK_HEIGHT", default_value_t = 500)]
    chunk_height: u32,

    /// Overlap between chunks in points.
    #[arg(long, env = "PDF2TABLE_OVERLAP", default_value_t = 50)]
    overlap: u32,

    /// Maximum concurrent model calls.
    #[arg(short, long, env = "PDF2TABLE_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Attempts per chunk before giving up.
    #[arg(long, env = "PDF2TABLE_MAX_ATTEMPTS", default_value_t = 6)]
    max_attempts: u32,

    /// Downscale chunks wider than this many pixels before upload (0 = off).
    #[arg(long, env = "PDF2TABLE_MAX_CHUNK_WIDTH", default_value_t = 0)]
    max_chunk_width: u32,

    /// Cell delimiter the model is asked to use.
    #[arg(long, env = "PDF2TABLE_DELIMITER", default_value_t = '|')]
    delimiter: char,

    /// Path to a text file containing a custom extraction prompt.
    #[arg(long, env = "PDF2TABLE_PROMPT")]
    prompt: Option<PathBuf>,

    /// Do not store rendered page images.
    #[arg(long, env = "PDF2TABLE_NO_PAGE_IMAGES")]
    no_page_images: bool,

    /// Store every chunk image (debugging).
    #[arg(long, env = "PDF2TABLE_SAVE_CHUNK_IMAGES")]
    save_chunk_images: bool,

    /// Store every raw model response (debugging).
    #[arg(long, env = "PDF2TABLE_SAVE_RAW_CHUNKS")]
    save_raw_chunks: bool,

    /// Print the global table as JSON instead of a pipe table.
    #[arg(long, env = "PDF2TABLE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2TABLE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TABLE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TABLE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar gives all the feedback that matters, so library logs
    // are reduced to errors while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    let config = build_config(&cli).await?;
    let delimiter = config.delimiter;
    let app = AppContext::from_config(config);

    let bytes = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let submission = app
        .submit(bytes, cli.password.clone())
        .await
        .with_context(|| format!("Rejected {}", cli.input.display()))?;
    let document_id = submission.document_id.clone();

    let status = if show_progress {
        watch_progress(&app, &document_id, submission.num_pages).await?
    } else {
        app.wait(&document_id).await?
    };

    if status.state != DocumentState::Completed {
        if !cli.quiet {
            eprintln!("{} Extraction failed for document {}", red("✘"), bold(&document_id));
        }
        bail!(
            "{}",
            status.message.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let table = app
        .global_table(&document_id)
        .await?
        .context("Document completed without a global table")?;

    if let Some(ref path) = cli.output {
        let json = serde_json::to_string_pretty(&table).context("Failed to serialize table")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        serde_json::to_writer_pretty(&mut out, &table).context("Failed to serialize table")?;
        writeln!(out)?;
    } else if cli.output.is_none() {
        write_pipe_table(&mut out, &table, delimiter)?;
    }

    if !cli.quiet {
        eprintln!(
            "{} {} rows from {} pages  {}",
            green("✔"),
            bold(&table.rows.len().to_string()),
            submission.num_pages,
            dim(&format!("document {document_id}")),
        );
    }

    Ok(())
}

/// Poll the progress store until the document is terminal, mirroring it on
/// a progress bar.
async fn watch_progress(app: &AppContext, document_id: &str, num_pages: usize) -> Result<ProgressState> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_prefix("Extracting");
    bar.enable_steady_tick(Duration::from_millis(80));

    loop {
        let state = app
            .status(document_id)
            .await?
            .with_context(|| format!("Document {document_id} disappeared"))?;

        bar.set_position(state.progress as u64);
        bar.set_message(describe(&state, num_pages));

        if state.is_terminal() {
            bar.finish_and_clear();
            return Ok(state);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn describe(state: &ProgressState, num_pages: usize) -> String {
    let mut parts = Vec::new();
    if let Some(page) = state.current_page {
        parts.push(format!("page {}/{}", page, state.total_pages.unwrap_or(num_pages)));
    }
    if let Some(chunk) = state.current_chunk {
        parts.push(format!("chunk {chunk}"));
    }
    if let Some(ref message) = state.message {
        parts.push(message.clone());
    }
    if parts.is_empty() {
        state.state.to_string()
    } else {
        parts.join("  ")
    }
}

fn write_pipe_table(out: &mut impl Write, table: &GlobalTable, delimiter: char) -> io::Result<()> {
    let sep = format!(" {delimiter} ");
    if !table.header.is_empty() {
        writeln!(out, "{}", table.header.join(&sep))?;
        let rule: Vec<&str> = table.header.iter().map(|_| "---").collect();
        writeln!(out, "{}", rule.join(&sep))?;
    }
    for row in &table.rows {
        writeln!(out, "{}", row.values.join(&sep))?;
    }
    Ok(())
}

async fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .dpi(cli.dpi)
        .chunk_height(cli.chunk_height)
        .overlap(cli.overlap)
        .concurrency(cli.concurrency)
        .max_attempts(cli.max_attempts)
        .max_chunk_width(cli.max_chunk_width)
        .delimiter(cli.delimiter)
        .storage_dir(&cli.storage)
        .save_page_images(!cli.no_page_images)
        .save_chunk_images(cli.save_chunk_images)
        .save_raw_chunks(cli.save_raw_chunks);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
        builder = builder.prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}
