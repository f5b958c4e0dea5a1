//! Lexivox CLI - pronunciation-correct TTS job service
//!
//! Runs the HTTP API, the segment workers, or both, depending on the
//! configured role. Also exposes a one-shot dictionary compile command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lexivox::config::{Role, Settings};
use lexivox::core::metrics::ServiceMetrics;
use lexivox::dict::{AutoLearner, DictStore, Resolver};
use lexivox::jobs::{spawn_workers, JobBackend, JobManager, MemoryBackend, RedisBackend};
use lexivox::server::AppState;
use lexivox::synth::{CommandSynthesizerFactory, EspeakPhonemizer, FfmpegCodec, SynthesizerPool};
use lexivox::{SegmentCache, VERSION};

/// Pronunciation-correct TTS job service for long-form content
#[derive(Parser, Debug)]
#[command(name = "lexivox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the service (API, workers, or both per the configured role)
    Serve {
        /// Override the configured role (all | api | worker)
        #[arg(long)]
        role: Option<String>,

        /// Override the bind port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a worker-only process (shorthand for --role worker)
    Worker,

    /// Compile dictionary packs for the configured model and exit
    CompileDicts,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Settings::default().validated().context("default config")?,
    };
    settings.ensure_dirs().context("creating data directories")?;
    Ok(settings)
}

/// Wire every service component from settings
fn build_manager(settings: Arc<Settings>) -> Result<(Arc<JobManager>, Arc<DictStore>)> {
    let dict_store = Arc::new(DictStore::open(
        settings.dict_dir.clone(),
        settings.compiled_dir.clone(),
    ));
    let learner = settings.autolearn.then(|| {
        Arc::new(AutoLearner::open(
            settings.autolearn_path(),
            Duration::from_secs(settings.autolearn_flush_seconds),
        ))
    });
    let phonemizer = Arc::new(EspeakPhonemizer::new(
        settings.espeak_command.clone(),
        "en-us",
    ));
    let resolver = Arc::new(Resolver::new(
        Arc::clone(&dict_store),
        learner,
        phonemizer,
        settings.phoneme_mode.clone(),
        settings.autolearn_on_miss,
        settings.autolearn_min_len,
    ));

    let cache = Arc::new(SegmentCache::new(
        settings.segments_dir(),
        settings.merged_dir(),
        settings.tmp_dir(),
        settings.cache_max_mb,
    ));

    let backend: Arc<dyn JobBackend> = match &settings.redis_url {
        Some(url) => {
            info!("distributed mode: connecting to redis");
            Arc::new(
                RedisBackend::connect(url, Duration::from_secs(settings.jobs_ttl_seconds))
                    .context("connecting to redis")?,
            )
        }
        None => Arc::new(MemoryBackend::new(Some(settings.jobs_dir()))),
    };

    let factory = Arc::new(CommandSynthesizerFactory::new(
        settings.synth_command.clone(),
        settings.synth_phoneme_flag.clone(),
        settings.gpu,
    ));
    let pool = Arc::new(SynthesizerPool::new(factory, settings.workers));
    let codec = Arc::new(FfmpegCodec::new(
        settings.ffmpeg_command.clone(),
        settings.tmp_dir(),
    ));

    let manager = Arc::new(JobManager::new(
        Arc::clone(&settings),
        backend,
        resolver,
        cache,
        pool,
        codec,
        Arc::new(ServiceMetrics::new()),
    ));
    Ok((manager, dict_store))
}

fn parse_role(raw: &str) -> Result<Role> {
    match raw.trim().to_lowercase().as_str() {
        "all" => Ok(Role::All),
        "api" => Ok(Role::Api),
        "worker" => Ok(Role::Worker),
        other => anyhow::bail!("unknown role '{}'; expected all|api|worker", other),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    info!("lexivox v{}", VERSION);

    let mut settings = load_settings(&cli)?;

    match &cli.command {
        Commands::Serve { role, port } => {
            if let Some(role) = role {
                settings.role = parse_role(role)?;
            }
            if let Some(port) = port {
                settings.port = *port;
            }
            run_service(settings)
        }
        Commands::Worker => {
            settings.role = Role::Worker;
            run_service(settings)
        }
        Commands::CompileDicts => {
            let store = DictStore::open(settings.dict_dir.clone(), settings.compiled_dir.clone());
            let compiled = store
                .compile_packs(&settings.model_id, &settings.compiler_version)
                .context("compiling packs")?;
            for path in compiled {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn run_service(settings: Settings) -> Result<()> {
    let role = settings.role;
    let settings = Arc::new(settings);
    let (manager, dict_store) = build_manager(Arc::clone(&settings))?;

    JobManager::spawn_maintenance(Arc::clone(&manager));
    if settings.warmup_default {
        manager.warmup_default_model();
    }

    let run_workers = matches!(role, Role::All | Role::Worker);
    let run_api = matches!(role, Role::All | Role::Api);

    if run_workers {
        let handles = spawn_workers(Arc::clone(&manager));
        info!(workers = handles.len(), "workers started");
        if !run_api {
            // Worker-only process: park this thread while workers run
            for handle in handles {
                let _ = handle.join();
            }
            return Ok(());
        }
    }

    let state = Arc::new(AppState::new(settings, manager, dict_store));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    runtime.block_on(lexivox::server::serve(state))
}
