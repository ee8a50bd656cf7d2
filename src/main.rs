use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use room_visualizer::{
    app_state::AppState,
    config::{ConfigOverrides, WidgetConfig},
    models::{
        job::{ImageBlob, Job, JobId, JobState, NewJob},
        state::{AppSnapshot, ModelTier, QueueTab},
    },
    services::{
        actions,
        generation::HttpGenerationClient,
        processor,
        session_store::{FileSessionStorage, SessionStorage},
        store::Store,
    },
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "room-visualizer")]
#[command(about = "Queue room photos for furniture visualization and follow their progress")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session directory (defaults to ROOM_VISUALIZER_SESSION_DIR)
    #[arg(long, global = true)]
    session_dir: Option<PathBuf>,

    /// Print Prometheus metrics on exit
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a room photo for a product
    Submit {
        /// Room photo (PNG, JPEG or WebP)
        #[arg(short, long)]
        image: PathBuf,

        /// Product page URL
        #[arg(short, long)]
        product_url: String,

        #[arg(long)]
        product_name: Option<String>,

        /// fast or quality (defaults to the session's selected model)
        #[arg(short, long)]
        model: Option<ModelTier>,

        /// Return once the job is queued instead of waiting for the result
        #[arg(long)]
        no_wait: bool,
    },

    /// Resume interrupted work and wait until the queue settles
    Resume,

    /// Show the queue
    Status {
        /// all, active, completed or failed
        #[arg(long, default_value = "all")]
        tab: QueueTab,
    },

    /// Put a failed job back in the queue
    Retry { id: String },

    /// Remove a job from the queue
    Remove { id: String },

    /// Remove all completed jobs
    ClearCompleted,

    /// Drop everything this session holds
    EndSession,
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    let config = WidgetConfig::from_env()?.merged(ConfigOverrides {
        session_dir: cli.session_dir.clone(),
        ..ConfigOverrides::default()
    })?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let prometheus = if cli.metrics {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };
    processor::describe_metrics();

    tracing::info!(
        domain = %config.domain,
        api_endpoint = %config.api_endpoint,
        session_dir = %config.session_dir.display(),
        "Opening session"
    );
    let storage: Arc<dyn SessionStorage> = Arc::new(FileSessionStorage::new(config.session_dir.clone())?);

    let outcome = run(cli.command, storage, config).await;

    if let Some(handle) = prometheus {
        print!("{}", handle.render());
    }
    outcome
}

async fn run(command: Commands, storage: Arc<dyn SessionStorage>, config: WidgetConfig) -> CliResult {
    // Read-only commands must not kick off generation calls they would then abandon.
    match command {
        Commands::Status { tab } => {
            let store = Store::new(storage, config);
            print_queue(&store.state(), tab);
            return Ok(());
        }
        Commands::EndSession => {
            storage.clear()?;
            println!("Session cleared");
            return Ok(());
        }
        _ => {}
    }

    let client = HttpGenerationClient::from_config(&config)?;
    let app = AppState::launch(storage, config, client)?;

    let wait = match command {
        Commands::Submit {
            image,
            product_url,
            product_name,
            model,
            no_wait,
        } => {
            let bytes = tokio::fs::read(&image).await?;
            let request = NewJob {
                product_name,
                model,
                ..NewJob::new(product_url, ImageBlob::from_upload(bytes)?)
            };
            let id = actions::add_to_queue(&app.store, request).await?;
            println!("Queued job {id}");
            !no_wait
        }
        Commands::Retry { id } => {
            let id = JobId::from(id);
            if !actions::retry_job(&app.store, &id) {
                return Err(format!("Job {id} is not a failed job in this session").into());
            }
            println!("Retrying job {id}");
            true
        }
        Commands::Remove { id } => {
            let id = JobId::from(id);
            if !actions::remove_from_queue(&app.store, &id) {
                return Err(format!("Job {id} not found").into());
            }
            println!("Removed job {id}");
            true
        }
        Commands::ClearCompleted => {
            let cleared = actions::clear_completed(&app.store);
            println!("Cleared {cleared} completed job(s)");
            true
        }
        Commands::Resume => true,
        Commands::Status { .. } | Commands::EndSession => false,
    };

    if wait {
        tokio::select! {
            state = app.wait_until_settled() => print_queue(&state, QueueTab::All),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, unfinished jobs resume on the next run");
            }
        }
    }

    app.processor.shutdown();
    Ok(())
}

fn print_queue(state: &AppSnapshot, tab: QueueTab) {
    let summary = state.summary();
    println!(
        "{} job(s): {} pending, {} processing, {} completed, {} failed",
        summary.total(),
        summary.pending,
        summary.processing,
        summary.completed,
        summary.failed
    );
    for job in state.jobs_in_tab(tab) {
        println!("{}", describe(job));
    }
}

fn describe(job: &Job) -> String {
    let product = job.product_name.as_deref().unwrap_or(&job.product_url);
    let detail = match &job.state {
        JobState::Completed { result, .. } => result.generated_image_url.clone(),
        JobState::Error { error, .. } => error.clone(),
        JobState::Processing { started_at } => format!("since {}", started_at.to_rfc3339()),
        JobState::Pending => String::new(),
    };
    format!(
        "{:<36}  {:<10}  {:<7}  {}  {}",
        job.id.as_str(),
        job.status().to_string(),
        job.selected_model.to_string(),
        product,
        detail
    )
}
