//! Biogate CLI - Drive the backend orchestrator from the command line
//!
//! Backends are simulated adapters described in a JSON file, so every
//! orchestrator path (probing, plugin loading, dispatch, retries, lockout)
//! can be exercised without sensor hardware.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use biogate_core::{CryptoObject, CryptoPurpose, FailureReason, Modality};
use biogate_engine::{
    sim, AdapterFactory, AuthEvent, AuthListener, AuthRequest, Biogate, DispatchOutcome,
    EngineConfig, FailureReport, RecordingListener, RegistryEvent, RestartPredicate,
    SimulatedFactory, StaticProviders,
};

#[derive(Parser)]
#[command(name = "biogate")]
#[command(about = "Biometric backend orchestrator driven by simulated backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file (defaults to $BIOGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the init pipeline and print the registry
    Probe {
        /// JSON file describing the simulated backends
        #[arg(short, long)]
        backends: PathBuf,
    },

    /// Run one authentication attempt and print every callback
    Auth {
        /// JSON file describing the simulated backends
        #[arg(short, long)]
        backends: PathBuf,

        /// Requested modalities (fingerprint, face, iris, voice, palm, heartrate, behavior, any)
        #[arg(short, long = "modality", required = true, num_args = 1..)]
        modalities: Vec<Modality>,

        /// Skip the enrollment check for plugin backends
        #[arg(long)]
        registration: bool,

        /// Silently retry AUTHENTICATION_FAILED up to N times
        #[arg(long, default_value_t = 0)]
        retry_auth_failures: u32,

        /// Cancel the attempt if it has not finished after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Persisted lockout commands
    #[command(subcommand)]
    Lockout(LockoutCommands),
}

#[derive(Subcommand)]
enum LockoutCommands {
    /// Show permanent lockouts
    Status {
        #[arg(short, long)]
        modality: Option<Modality>,
    },

    /// Clear one permanent lockout, or all of them
    Reset {
        #[arg(short, long)]
        modality: Option<Modality>,
    },
}

/// Prints callbacks as they arrive and records them for the caller
#[derive(Default)]
struct PrintingListener {
    recorded: RecordingListener,
}

impl AuthListener for PrintingListener {
    fn on_success(&self, modality: Modality, crypto: Option<CryptoObject>) {
        println!("  success    {}", modality);
        self.recorded.on_success(modality, crypto);
    }

    fn on_help(&self, modality: Modality, message: &str) {
        println!("  help       {}: {}", modality, message);
        self.recorded.on_help(modality, message);
    }

    fn on_failure(&self, failure: FailureReport) {
        let kind = if failure.terminal { "failure" } else { "notice" };
        println!("  {:<10} {}: {}", kind, failure.modality, failure.reason);
        self.recorded.on_failure(failure);
    }

    fn on_canceled(&self, reason: Option<FailureReason>, modality: Modality) {
        match reason {
            Some(reason) => println!("  canceled   {}: {}", modality, reason),
            None => println!("  canceled   {}", modality),
        }
        self.recorded.on_canceled(reason, modality);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "biogate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Probe { backends } => probe(config, &backends).await,
        Commands::Auth {
            backends,
            modalities,
            registration,
            retry_auth_failures,
            timeout_ms,
        } => {
            authenticate(
                config,
                &backends,
                modalities,
                registration,
                retry_auth_failures,
                Duration::from_millis(timeout_ms),
            )
            .await
        }
        Commands::Lockout(cmd) => lockout(config, cmd),
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<EngineConfig> {
    let path = explicit
        .or_else(|| std::env::var("BIOGATE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("biogate")
                .join("engine.json")
        });

    if path.exists() {
        info!("Loading config from {:?}", path);
        EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        debug!("No config at {:?}, using defaults", path);
        Ok(EngineConfig::default())
    }
}

/// Build an orchestrator over the simulated backends in `backends`
fn build(config: EngineConfig, backends: &Path) -> Result<Biogate> {
    let specs = sim::load_specs(backends)
        .with_context(|| format!("reading backends from {}", backends.display()))?;
    let (plugins, natives): (Vec<_>, Vec<_>) = specs.into_iter().partition(|s| s.plugin);

    let providers = StaticProviders::new(
        plugins
            .into_iter()
            .map(|spec| Arc::new(SimulatedFactory::new(spec)) as Arc<dyn AdapterFactory>)
            .collect(),
    );

    let biogate = Biogate::builder(config)
        .backends(
            natives
                .into_iter()
                .map(|spec| Arc::new(SimulatedFactory::new(spec)) as Arc<dyn AdapterFactory>),
        )
        .plugin_lookup(Arc::new(providers))
        .build()?;
    Ok(biogate)
}

/// Init, wait for the registry, then load plugins
async fn start(biogate: &Biogate) -> Result<()> {
    let runs = biogate.completed_init_runs();
    biogate.init(None, None);
    let limit = biogate.config().probe_timeout() + Duration::from_secs(1);
    if !biogate.wait_for_init(runs, limit).await {
        bail!("init pipeline did not finish within {:?}", limit);
    }

    if let Some(loaded) = biogate.load_custom_modules().await? {
        if !loaded.is_empty() {
            info!("Loaded plugins: {:?}", loaded);
        }
    }
    Ok(())
}

async fn probe(config: EngineConfig, backends: &Path) -> Result<()> {
    let biogate = build(config, backends)?;
    let mut events = biogate.subscribe();
    start(&biogate).await?;

    let mut newly_available = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Ready(ready) = event {
            newly_available = ready.newly_available;
        }
    }

    let snapshot = biogate.snapshot();
    println!("Registry ({} backends):", snapshot.len());
    for entry in snapshot.entries() {
        let adapter = &entry.adapter;
        let origin = if entry.plugin { "plugin" } else { "native" };
        println!(
            "  {:<16} {:<7} enrolled={} locked={}",
            adapter.backend_id().to_string(),
            origin,
            adapter.has_enrolled().await,
            biogate.is_locked_out(adapter.modality()).await
        );
    }
    println!("Available: {}", join(&biogate.available_modalities()));
    println!("Newly available: {}", join(&newly_available));
    Ok(())
}

async fn authenticate(
    config: EngineConfig,
    backends: &Path,
    modalities: Vec<Modality>,
    registration: bool,
    retry_auth_failures: u32,
    timeout: Duration,
) -> Result<()> {
    let biogate = build(config, backends)?;
    start(&biogate).await?;

    let mut request = AuthRequest::new(CryptoPurpose::encrypt(), modalities);
    if registration {
        request = request.registration_mode();
    }
    if retry_auth_failures > 0 {
        request = request.with_restart_predicate(RestartPredicate::limited(
            vec![FailureReason::AuthenticationFailed],
            retry_auth_failures,
        ));
    }

    let listener = Arc::new(PrintingListener::default());
    println!("Authenticating with {}", join(&request.modalities));
    if biogate.authenticate(request, listener.clone()) == DispatchOutcome::Ignored {
        bail!("request was ignored");
    }

    let outcome = match listener.recorded.wait_for_terminal(timeout).await {
        Some(event) => event,
        None => {
            info!("No result after {:?}, canceling", timeout);
            biogate.cancel_authentication();
            listener
                .recorded
                .wait_for_terminal(Duration::from_secs(1))
                .await
                .context("cancel was not acknowledged")?
        }
    };

    match outcome {
        AuthEvent::Success { modality, .. } => {
            println!("Authenticated with {}", modality);
            Ok(())
        }
        AuthEvent::Failure(report) => bail!("authentication failed: {}", report.reason),
        AuthEvent::Canceled { .. } => bail!("authentication canceled"),
        AuthEvent::Help { .. } => bail!("unexpected non-terminal outcome"),
    }
}

fn lockout(config: EngineConfig, cmd: LockoutCommands) -> Result<()> {
    let biogate = Biogate::builder(config).build()?;

    match cmd {
        LockoutCommands::Status { modality } => {
            if let Some(modality) = modality {
                println!("{}", biogate.describe_lockout(modality));
                return Ok(());
            }
            let records = biogate.lockout_records();
            if records.is_empty() {
                println!("No permanent lockouts");
            }
            for record in records {
                println!(
                    "  {:<12} locked since {}",
                    record.modality,
                    record
                        .locked_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        LockoutCommands::Reset { modality } => match modality {
            Some(modality) => {
                biogate.reset_lockout(modality)?;
                println!("Lockout cleared for {}", modality);
            }
            None => {
                biogate.reset_all_lockouts()?;
                println!("All lockouts cleared");
            }
        },
    }
    Ok(())
}

fn join(modalities: &[Modality]) -> String {
    if modalities.is_empty() {
        return "-".to_string();
    }
    modalities
        .iter()
        .map(|m| m.key())
        .collect::<Vec<_>>()
        .join(", ")
}
