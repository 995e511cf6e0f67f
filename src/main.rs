use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use local_mind::assets::HttpFetcher;
use local_mind::store::SqliteStore;
use local_mind::types::UploadState;
use local_mind::{SemanticIndex, Session, WorkerConfig, WorkerParts};

/// Index chat exports and notes on this machine, then search them.
#[derive(Parser, Debug)]
#[command(name = "local-mind", version)]
struct Cli {
    /// Text or markdown files to ingest. The file name is the document id.
    files: Vec<PathBuf>,

    /// Search the index once ingestion has finished.
    #[arg(short, long)]
    query: Option<String>,

    /// Restrict the search to these document ids (repeatable).
    #[arg(long = "only")]
    only: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    local_mind::init_tracing();
    let cli = Cli::parse();

    let settings = local_mind::config::get_settings().context("failed to load settings")?;
    let store = SqliteStore::open(&settings.store_path())
        .with_context(|| format!("failed to open {}", settings.store_path().display()))?;

    let session = Session::start(
        WorkerParts {
            index: Box::new(SemanticIndex::new(settings.max_chunk_tokens)),
            store: Arc::new(store),
            fetcher: Arc::new(HttpFetcher::new()),
            config: WorkerConfig::from(&settings),
        },
        settings.completed_display_ms,
    );
    let mut state = session.subscribe();

    let initialized = loop {
        let current = state.borrow_and_update().clone();
        if current.ready || current.failed {
            break current;
        }
        if let Some(progress) = current.init_progress {
            eprint!("\r{} {:>5.1}%", progress.status.label(), progress.percent);
        }
        state.changed().await?;
    };
    eprintln!();
    if initialized.failed {
        let reason = initialized.last_error.unwrap_or_default();
        session.shutdown().await;
        bail!("initialization failed: {reason}");
    }
    if !initialized.documents.is_empty() {
        println!("{} document(s) already indexed", initialized.documents.len());
    }

    for path in &cli.files {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        session.add_document(id, content);
    }

    let settled = state.wait_for(|s| s.uploads_settled()).await?.clone();
    for path in &cli.files {
        let Some(id) = path.file_name().map(|n| n.to_string_lossy()) else {
            continue;
        };
        match settled.uploads.get(&*id) {
            Some(upload) if upload.status == UploadState::Completed => println!("indexed {id}"),
            Some(upload) => println!(
                "failed {id}: {}",
                upload.error.as_deref().unwrap_or("unknown error")
            ),
            None => {}
        }
    }

    if let Some(query) = cli.query.as_deref() {
        let allowed = (!cli.only.is_empty()).then(|| cli.only.clone());
        if session.search(query, allowed).is_some() {
            let done = state.wait_for(|s| !s.is_searching).await?.clone();
            if done.search_results.is_empty() {
                println!("no results");
            }
            for result in &done.search_results {
                let speaker = match (&result.sender, &result.date) {
                    (Some(sender), Some(date)) => format!(" {sender} ({date})"),
                    _ => String::new(),
                };
                println!("[{:.2}] {}{speaker}", result.score, result.doc_id);
                println!("    {}", result.content.replace('\n', "\n    "));
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
