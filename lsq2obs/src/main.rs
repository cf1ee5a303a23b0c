use std::{
    collections::{BTreeSet, HashSet},
    fs,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use lsq2obs::convert::{Conversion, convert_content, convert_document};
use lsq2obs::core::BlockId;
use lsq2obs::live::EditorView;
use lsq2obs::plugin::LogseqToObsidian;
use lsq2obs::render::{CmarkRenderer, Element};
use lsq2obs::settings::{JsonFileStore, Settings};
use lsq2obs::vault::{FsVault, MARKDOWN_EXTENSION};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(
    name = "lsq2obs",
    about = "Convert Logseq notes to Obsidian conventions and expand block references",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the open-document conversion on markdown files.
    Convert(ConvertArgs),

    /// Find the block that owns an identifier.
    Resolve(ResolveArgs),

    /// Render a document to HTML with block references expanded.
    Render(RenderArgs),

    /// Print a document as the live editor shows it, references spliced in.
    Preview(PreviewArgs),

    /// Show or update the persisted plugin settings.
    Settings(SettingsArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Markdown files or directories containing markdown files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Vault root holding the plugin settings.
    #[arg(long)]
    vault: PathBuf,
    /// Overwrite changed files instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Translate task markers to checkboxes regardless of the stored setting.
    #[arg(long)]
    todo_to_checkbox: bool,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    /// Vault root to search.
    #[arg(long)]
    vault: PathBuf,
    /// Block identifier (lowercase UUID).
    id: BlockId,
    /// Emit JSON instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RenderArgs {
    /// Vault root to resolve references against.
    #[arg(long)]
    vault: PathBuf,
    /// Document to render.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    /// Vault root to resolve references against.
    #[arg(long)]
    vault: PathBuf,
    /// Document to preview.
    file: PathBuf,
    /// Visible byte range (`start..end`); may be repeated. Defaults to the whole document.
    #[arg(long = "range", value_parser = parse_range)]
    ranges: Vec<Range<usize>>,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    /// Vault root holding the plugin settings.
    #[arg(long)]
    vault: PathBuf,
    /// New value for the checkbox conversion flag.
    #[arg(long)]
    convert_todo_to_checkbox: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Convert(args) => handle_convert(args).await,
        Commands::Resolve(args) => handle_resolve(args).await,
        Commands::Render(args) => handle_render(args).await,
        Commands::Preview(args) => handle_preview(args).await,
        Commands::Settings(args) => handle_settings(args),
    }
}

fn load_plugin(vault: Arc<FsVault>) -> Result<LogseqToObsidian> {
    let store = JsonFileStore::for_vault(vault.root());
    LogseqToObsidian::load(vault, Box::new(store), Arc::new(CmarkRenderer::new()))
}

async fn handle_convert(args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        inputs,
        vault,
        in_place,
        todo_to_checkbox,
    } = args;

    let vault = FsVault::open(&vault)?;
    let mut settings = Settings::load(&JsonFileStore::for_vault(vault.root()))?;
    if todo_to_checkbox {
        settings.convert_todo_to_checkbox = true;
    }

    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }

    let mut rewritten = 0;
    for (idx, path) in expanded.iter().enumerate() {
        if in_place {
            let doc = vault.document_for(path)?;
            if convert_document(&vault, &doc, &settings).await? == Conversion::Rewritten {
                rewritten += 1;
            }
        } else {
            let content =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let converted = convert_content(&content, &settings);
            if expanded.len() > 1 {
                if idx > 0 {
                    println!();
                }
                println!("== {} ==", path.display());
            }
            print!("{converted}");
            if !converted.ends_with('\n') {
                println!();
            }
        }
    }

    if in_place {
        info!("{} of {} files rewritten", rewritten, expanded.len());
    }
    Ok(())
}

async fn handle_resolve(args: ResolveArgs) -> Result<()> {
    let ResolveArgs { vault, id, json } = args;
    let plugin = load_plugin(Arc::new(FsVault::open(&vault)?))?;

    let Some(block) = plugin.resolver().resolve(id).await? else {
        anyhow::bail!("block {} not found", id);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&block)?);
    } else {
        println!("{}", block.content);
        debug!("found in {}", block.source.path);
    }
    Ok(())
}

async fn handle_render(args: RenderArgs) -> Result<()> {
    let RenderArgs { vault, file } = args;
    let vault = Arc::new(FsVault::open(&vault)?);
    let doc = vault.document_for(&file)?;
    let content = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let plugin = load_plugin(vault)?;

    let mut root = Element::new("div");
    root.children = CmarkRenderer::new().render_nodes(&content);
    let settled = plugin.post_process(&mut root, &doc.path.0).await;
    debug!("{} block references settled", settled);
    println!("{}", root.to_html());
    Ok(())
}

async fn handle_preview(args: PreviewArgs) -> Result<()> {
    let PreviewArgs {
        vault,
        file,
        ranges,
    } = args;
    let vault = Arc::new(FsVault::open(&vault)?);
    let content = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let plugin = load_plugin(vault)?;

    let view = if ranges.is_empty() {
        EditorView::new(content)
    } else {
        EditorView::with_visible_ranges(content, ranges)
    };
    let (mut preview, ctx) = plugin.live_preview(view);

    let (tx, mut rx) = mpsc::unbounded_channel();
    preview.spawn_resolutions(&ctx, &tx);
    drop(tx);
    while let Some(completion) = rx.recv().await {
        preview.apply(completion);
    }

    let spliced = preview.splice();
    print!("{spliced}");
    if !spliced.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn handle_settings(args: SettingsArgs) -> Result<()> {
    let SettingsArgs {
        vault,
        convert_todo_to_checkbox,
    } = args;
    let mut plugin = load_plugin(Arc::new(FsVault::open(&vault)?))?;
    if let Some(value) = convert_todo_to_checkbox {
        plugin.set_convert_todo_to_checkbox(value)?;
        info!("convertTodoToCheckbox set to {}", value);
    }
    println!("{}", serde_json::to_string_pretty(&plugin.settings())?);
    Ok(())
}

fn parse_range(s: &str) -> Result<Range<usize>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got {s:?}"))?;
    let start: usize = start
        .trim()
        .parse()
        .map_err(|e| format!("bad range start {start:?}: {e}"))?;
    let end: usize = end
        .trim()
        .parse()
        .map_err(|e| format!("bad range end {end:?}: {e}"))?;
    if end < start {
        return Err(format!("range end {end} precedes start {start}"));
    }
    Ok(start..end)
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == MARKDOWN_EXTENSION)
        .unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("Scanning directory {:?}", canonical);
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_markdown(&canonical) {
                anyhow::bail!("{:?} is not a .md file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        debug!("Found markdown file {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}
