use anyhow::Result;
use clap::{Parser, Subcommand};
use image_matcher::{
    ImageSearch, ImageSource, MatchResult, SearchConfig, SearchHandler, UploadOptions,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "image-matcher", about = "Visual search client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for an image locally and/or remotely
    Search {
        /// Path to the query image
        image: PathBuf,
        /// Only match against the on-device index
        #[arg(long, conflicts_with = "remote_only")]
        local_only: bool,
        /// Only submit to the remote service
        #[arg(long)]
        remote_only: bool,
    },
    /// Upload exemplar images for a new object to the remote service
    Upload {
        /// Object name shown in match results
        #[arg(long)]
        name: String,
        /// Exemplar image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Metadata string stored with the object
        #[arg(long)]
        meta: Option<String>,
        /// Collection to file the object under
        #[arg(long)]
        collection: Option<String>,
        /// Caller-assigned object id
        #[arg(long)]
        custom_id: Option<String>,
    },
    /// Fetch the stored result for a previously assigned query id
    Fetch {
        /// Query id returned by a remote submission
        qid: String,
    },
}

struct CliHandler {
    results: mpsc::UnboundedSender<MatchResult>,
}

impl SearchHandler for CliHandler {
    fn on_query_id_assigned(&self, query_id: &str, _image: &ImageSource) {
        info!("Query id assigned: {}", query_id);
    }

    fn on_result(&self, result: MatchResult) {
        let _ = self.results.send(result);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SearchConfig::new()?;

    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting image-matcher");

    match cli.command {
        Commands::Search {
            image,
            local_only,
            remote_only,
        } => run_search(config, image, local_only, remote_only).await?,
        Commands::Upload {
            name,
            images,
            meta,
            collection,
            custom_id,
        } => run_upload(config, name, images, meta, collection, custom_id).await?,
        Commands::Fetch { qid } => run_fetch(config, qid).await?,
    }

    info!("Image-matcher finished");
    Ok(())
}

async fn run_search(
    mut config: SearchConfig,
    image: PathBuf,
    local_only: bool,
    remote_only: bool,
) -> Result<()> {
    if local_only {
        config.remote_enabled = false;
    }
    if remote_only {
        config.local_enabled = false;
    }
    let wait_for_index = config.local_enabled && config.bundle_directory.is_some();

    let search = ImageSearch::new(config)?;
    search.resume();
    if wait_for_index {
        info!("Waiting for the local index to come up");
        search.wait_index_ready().await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(CliHandler { results: tx });
    search.search(ImageSource::from_path(image), handler).await?;

    match tokio::time::timeout(Duration::from_secs(120), rx.recv()).await {
        Ok(Some(result)) => print_result(&result),
        Ok(None) => log::error!("Result channel closed without a result"),
        Err(_) => log::error!("Timed out waiting for a search result"),
    }

    search.pause();
    search.destroy();
    Ok(())
}

fn print_result(result: &MatchResult) {
    let source = if result.remote_match { "remote" } else { "local" };
    if let Some(e) = &result.error {
        println!("search failed ({}): {}", source, e);
        return;
    }
    if result.found() {
        println!(
            "match ({}): {}",
            source,
            result.object_name.as_deref().unwrap_or("<unnamed>")
        );
        if let Some(id) = &result.object_id {
            println!("  object id: {}", id);
        }
        if let Some(meta) = &result.object_meta {
            println!("  meta: {}", meta);
        }
    } else {
        println!("no match ({})", source);
    }
}

async fn run_upload(
    mut config: SearchConfig,
    name: String,
    images: Vec<PathBuf>,
    meta: Option<String>,
    collection: Option<String>,
    custom_id: Option<String>,
) -> Result<()> {
    config.local_enabled = false;
    config.remote_enabled = true;
    let search = ImageSearch::new(config)?;

    let sources: Vec<ImageSource> = images.into_iter().map(ImageSource::from_path).collect();
    let opts = UploadOptions {
        custom_id,
        meta,
        collection,
        json: true,
    };
    let response = search.upload_object(&sources, &name, &opts).await?;
    println!("{}", response);
    Ok(())
}

async fn run_fetch(mut config: SearchConfig, qid: String) -> Result<()> {
    config.local_enabled = false;
    config.remote_enabled = true;
    let search = ImageSearch::new(config)?;

    let response = search.fetch_result(&qid).await?;
    println!("{}", response);
    Ok(())
}
