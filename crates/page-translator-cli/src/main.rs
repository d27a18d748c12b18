//! Page Translator CLI - translate documents page by page into a durable project.

mod pages;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use page_translator_core::store::RecoveryPolicy;
use page_translator_core::{
    AppConfig, EnqueueOptions, ExportOptions, Lang, PageNumber, PageSource, ProjectStore,
    RunOutcome, Session, TranslatorConfig, create_translator, export_markdown,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::pages::DirectoryPageSource;

#[derive(Parser, Debug)]
#[command(name = "page-translate")]
#[command(author, version, about = "Translate documents page by page", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage root (default: $XDG_DATA_HOME/page-translator)
    #[arg(long, global = true, env = "PAGE_TRANSLATOR_STORAGE")]
    storage: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct TranslatorArgs {
    /// Source language code
    #[arg(short = 's', long)]
    source: Option<String>,

    /// Target language code
    #[arg(short = 't', long)]
    target: Option<String>,

    /// OpenAI API base URL
    #[arg(long, env = "OPENAI_API_BASE")]
    api_base: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY")]
    api_key: Option<String>,

    /// Model name for OpenAI-compatible API
    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,

    /// Maximum concurrent requests
    #[arg(long)]
    concurrency: Option<usize>,

    /// Skip verification after each translation
    #[arg(long)]
    no_verify: bool,

    /// Re-translate once, automatically, when verification finds severe problems
    #[arg(long)]
    fix_severe: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a directory of page files (one .txt/.md or image per page)
    Translate {
        /// Directory holding the page files
        input: PathBuf,

        /// Project name (default: the directory name)
        #[arg(long)]
        name: Option<String>,

        /// Translate only specific pages (e.g., "1-5" or "1,3,5")
        #[arg(long)]
        pages: Option<String>,

        #[command(flatten)]
        translator: TranslatorArgs,
    },
    /// Re-translate pages that failed or were flagged as severe
    RetryErrors {
        /// Project identifier
        file_id: String,

        /// Directory holding the page files
        input: PathBuf,

        #[command(flatten)]
        translator: TranslatorArgs,
    },
    /// Write a project's translations as Markdown
    Export {
        file_id: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include doubts and errors flagged on each page
        #[arg(long)]
        annotations: bool,
    },
    /// List stored projects
    Projects,
    /// Move a project to the trash
    Delete { file_id: String },
    /// Manage deleted projects
    #[command(subcommand)]
    Trash(TrashCommand),
    /// Reconcile interrupted writes and expire old trash
    Recover,
}

#[derive(Subcommand, Debug)]
enum TrashCommand {
    /// List deleted projects
    List,
    /// Restore one deleted project
    Restore { trash_id: String },
    /// Restore every deleted project
    RestoreAll,
    /// Permanently delete one entry
    Purge { trash_id: String },
    /// Permanently delete everything in the trash
    Empty,
}

fn parse_page_range(pages: &str, total: u32) -> Result<Vec<PageNumber>> {
    let mut result = Vec::new();

    for part in pages.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().context("Invalid page range start")?;
            let end: u32 = end.trim().parse().context("Invalid page range end")?;
            result.extend((start..=end).filter(|&p| p > 0 && p <= total));
        } else {
            let page: u32 = part.parse().context("Invalid page number")?;
            if page > 0 && page <= total {
                result.push(page);
            }
        }
    }

    result.sort_unstable();
    result.dedup();
    Ok(result)
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path).context("Failed to load config file")?
    } else {
        AppConfig::load()
    };
    if let Some(root) = &args.storage {
        config.storage.root = Some(root.clone());
    }
    Ok(config)
}

fn apply_translator_args(config: &mut AppConfig, args: &TranslatorArgs) -> Result<()> {
    if let Some(source) = &args.source {
        config.source_lang = Lang::new(source);
    }
    if let Some(target) = &args.target {
        config.target_lang = Lang::new(target);
    }
    if args.api_base.is_some() || args.api_key.is_some() || args.model.is_some() {
        let current = &config.translator;
        config.translator = TranslatorConfig {
            api_base: args.api_base.clone().unwrap_or_else(|| current.api_base.clone()),
            api_key: args.api_key.clone().or_else(|| current.api_key.clone()),
            model: args.model.clone().unwrap_or_else(|| current.model.clone()),
            ..current.clone()
        };
    }
    if let Some(concurrency) = args.concurrency {
        config.scheduler.concurrency = concurrency;
    }
    if args.no_verify {
        config.scheduler.verify_after_translate = false;
    }
    if args.fix_severe {
        config.scheduler.auto_fix_severe = true;
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

/// Open the store, reconciling anything a crash left behind.
async fn open_store(config: &AppConfig) -> Result<Arc<ProjectStore>> {
    let root = config.storage.root_dir();
    let store = ProjectStore::open(&root)
        .with_context(|| format!("Failed to open storage at {}", root.display()))?;

    let report = store
        .recover(RecoveryPolicy::from(&config.storage))
        .await
        .context("Recovery failed")?;
    if !report.promoted.is_empty() || !report.stale.is_empty() || !report.corrupted.is_empty() {
        warn!(
            "Recovered {} interrupted writes ({} stale, {} corrupted set aside)",
            report.promoted.len(),
            report.stale.len(),
            report.corrupted.len()
        );
    }
    if report.expired_trash > 0 {
        info!("Purged {} expired trash entries", report.expired_trash);
    }
    Ok(Arc::new(store))
}

async fn open_session(
    store: &Arc<ProjectStore>,
    file_id: &str,
    input: &Path,
    config: &AppConfig,
) -> Result<Session> {
    let source = DirectoryPageSource::open(input)
        .with_context(|| format!("Failed to read pages from {}", input.display()))?;
    let translator =
        create_translator(&config.translator).context("Failed to initialize translator")?;
    if !translator.is_available() {
        bail!("Translator {} is not configured", translator.name());
    }

    Session::open(Arc::clone(store), file_id, translator, Arc::new(source), config)
        .await
        .with_context(|| format!("Failed to open project {file_id}"))
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    // Template is hardcoded and valid, unwrap is safe
    #[allow(clippy::unwrap_used)]
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// Drive the progress bar until the scheduler has nothing left to do.
async fn watch_pages(session: &Session, pages: &[PageNumber], pb: &ProgressBar) {
    loop {
        let (done, failed) = page_counts(session, pages);
        pb.set_position(done as u64);
        if failed > 0 {
            pb.set_message(format!("{failed} failed"));
        }
        if session.scheduler().is_idle() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn page_counts(session: &Session, pages: &[PageNumber]) -> (usize, usize) {
    let statuses = session.scheduler().page_statuses();
    let done = session
        .scheduler()
        .with_document(|doc| pages.iter().filter(|&&p| doc.is_translated(p)).count());
    let failed = pages
        .iter()
        .filter(|p| statuses.get(p).is_some_and(|s| s.error.is_some()))
        .count();
    (done, failed)
}

async fn cmd_translate(
    config: &mut AppConfig,
    input: &Path,
    name: Option<String>,
    page_spec: Option<&str>,
    translator_args: &TranslatorArgs,
) -> Result<()> {
    apply_translator_args(config, translator_args)?;
    let store = open_store(config).await?;

    let total = DirectoryPageSource::open(input)
        .with_context(|| format!("Failed to read pages from {}", input.display()))?
        .page_count();
    if total == 0 {
        bail!("No page files found in {}", input.display());
    }

    let name = name
        .or_else(|| input.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .unwrap_or_else(|| "document".to_string());
    let canonical = input.canonicalize().unwrap_or_else(|_| input.to_path_buf());
    let doc = store
        .create_or_open(&name, canonical.to_str(), total)
        .await
        .context("Failed to create project")?;
    info!("Project {} has {} pages", doc.file_id, total);

    let session = open_session(&store, &doc.file_id, input, config).await?;

    let outcome = if let Some(spec) = page_spec {
        let pages = parse_page_range(spec, total)?;
        if pages.is_empty() {
            bail!("No valid pages to translate");
        }
        for &page in &pages {
            session.scheduler().enqueue(page, EnqueueOptions::back())?;
        }
        let pb = progress_bar(pages.len());
        watch_pages(&session, &pages, &pb).await;
        let (translated, failed) = page_counts(&session, &pages);
        pb.finish_with_message("done");
        RunOutcome::Completed { translated, failed }
    } else {
        let run = session.orchestrator.translate_all()?;
        let pages = run.pages.clone();
        let pb = progress_bar(pages.len());
        watch_pages(&session, &pages, &pb).await;
        let outcome = run.wait().await;
        pb.finish_with_message("done");
        outcome
    };

    let file_id = doc.file_id;
    session.close().await.context("Failed to save project")?;

    // CLI output is intentional
    #[allow(clippy::print_stdout)]
    match outcome {
        RunOutcome::Completed { translated, failed } => {
            println!("Project {file_id}: {translated} pages translated, {failed} failed");
            if failed > 0 {
                println!("Run `page-translate retry-errors {file_id} <input>` to retry");
            }
        }
        RunOutcome::Superseded | RunOutcome::Paused => {
            println!("Project {file_id}: run stopped before completion");
        }
    }
    Ok(())
}

async fn cmd_retry_errors(
    config: &mut AppConfig,
    file_id: &str,
    input: &Path,
    translator_args: &TranslatorArgs,
) -> Result<()> {
    apply_translator_args(config, translator_args)?;
    let store = open_store(config).await?;
    let session = open_session(&store, file_id, input, config).await?;

    let pages = session.orchestrator.retry_all_errors().await?;
    if !pages.is_empty() {
        let pb = progress_bar(pages.len());
        watch_pages(&session, &pages, &pb).await;
        pb.finish_with_message("done");
    }
    let (translated, failed) = page_counts(&session, &pages);
    session.close().await.context("Failed to save project")?;

    #[allow(clippy::print_stdout)]
    {
        println!(
            "Retried {} pages: {translated} translated, {failed} failed",
            pages.len()
        );
    }
    Ok(())
}

async fn cmd_export(
    config: &AppConfig,
    file_id: &str,
    output: Option<&Path>,
    annotations: bool,
) -> Result<()> {
    let store = open_store(config).await?;
    let doc = store.load(file_id).await?;
    let markdown = export_markdown(
        &doc,
        ExportOptions {
            include_annotations: annotations,
        },
    );

    match output {
        Some(path) => {
            std::fs::write(path, markdown)
                .with_context(|| format!("Failed to write output: {}", path.display()))?;
            info!("Exported {} to {}", file_id, path.display());
        }
        #[allow(clippy::print_stdout)]
        None => print!("{markdown}"),
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn cmd_projects(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    for project in store.list_projects().await? {
        let updated = project
            .updated_at
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{:<40} {:>4}/{:<4} {}  {}",
            project.file_id,
            project.translated_pages,
            project.total_pages,
            updated,
            project.file_name
        );
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn cmd_trash(config: &AppConfig, command: TrashCommand) -> Result<()> {
    let store = open_store(config).await?;
    let trash = store.trash();

    match command {
        TrashCommand::List => {
            for entry in trash.list()? {
                println!(
                    "{:<60} {}  {}",
                    entry.trash_id,
                    entry.deleted_at.format("%Y-%m-%d %H:%M"),
                    entry.file_id
                );
            }
        }
        TrashCommand::Restore { trash_id } => {
            let file_id = trash.restore(&trash_id).await?;
            println!("Restored {file_id}");
        }
        TrashCommand::RestoreAll => {
            let report = trash.restore_all().await?;
            for file_id in &report.restored {
                println!("Restored {file_id}");
            }
            for (trash_id, error) in &report.failed {
                println!("Could not restore {trash_id}: {error}");
            }
        }
        TrashCommand::Purge { trash_id } => {
            trash.purge(&trash_id)?;
            println!("Purged {trash_id}");
        }
        TrashCommand::Empty => {
            let count = trash.empty()?;
            println!("Purged {count} entries");
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn cmd_recover(config: &AppConfig) -> Result<()> {
    let root = config.storage.root_dir();
    let store = ProjectStore::open(&root)
        .with_context(|| format!("Failed to open storage at {}", root.display()))?;
    let report = store
        .recover(RecoveryPolicy::from(&config.storage))
        .await
        .context("Recovery failed")?;

    for path in &report.promoted {
        println!("promoted   {}", path.display());
    }
    for path in &report.stale {
        println!("stale      {}", path.display());
    }
    for path in &report.corrupted {
        println!("corrupted  {}", path.display());
    }
    println!(
        "{} old files purged, {} incomplete assets discarded, {} expired trash entries removed",
        report.purged, report.discarded_assets, report.expired_trash
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before parsing args so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = load_config(&args)?;

    match args.command {
        Command::Translate {
            input,
            name,
            pages,
            translator,
        } => cmd_translate(&mut config, &input, name, pages.as_deref(), &translator).await,
        Command::RetryErrors {
            file_id,
            input,
            translator,
        } => cmd_retry_errors(&mut config, &file_id, &input, &translator).await,
        Command::Export {
            file_id,
            output,
            annotations,
        } => cmd_export(&config, &file_id, output.as_deref(), annotations).await,
        Command::Projects => cmd_projects(&config).await,
        Command::Delete { file_id } => {
            let store = open_store(&config).await?;
            let trash_id = store.trash().delete(&file_id).await?;
            #[allow(clippy::print_stdout)]
            {
                println!("Moved {file_id} to trash as {trash_id}");
            }
            Ok(())
        }
        Command::Trash(command) => cmd_trash(&config, command).await,
        Command::Recover => cmd_recover(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_range() {
        assert_eq!(parse_page_range("1-3,5", 10).unwrap(), vec![1, 2, 3, 5]);
        assert_eq!(parse_page_range("8-12", 10).unwrap(), vec![8, 9, 10]);
        assert_eq!(parse_page_range("3, 3, 0", 10).unwrap(), vec![3]);
        assert!(parse_page_range("x", 10).is_err());
    }

    #[test]
    fn test_cli_parses_trash_commands() {
        let args = Args::try_parse_from(["page-translate", "trash", "restore", "abc"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Trash(TrashCommand::Restore { ref trash_id }) if trash_id == "abc"
        ));

        let args = Args::try_parse_from([
            "page-translate",
            "-vv",
            "translate",
            "pages/",
            "--pages",
            "1-2",
            "--no-verify",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(
            args.command,
            Command::Translate { ref translator, .. } if translator.no_verify
        ));
    }
}
