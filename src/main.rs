//! Upstage - drive an update attempt and verify the result
//!
//! Entry point for the `upstage` tool:
//! 1. `apply` runs one attempt described by upstage.toml
//! 2. `verify` checks a tree against a manifest without running anything
//! 3. `status`, `init`, `key`, `sign` and `install-policy` are helpers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use upstage::config::{self, Config};
use upstage::elevation::{ElevationCoordinator, ServiceSettings};
use upstage::environment::ProcessEnv;
use upstage::manifest::TreeManifest;
use upstage::orchestrator::{
    AttemptOutcome, AttemptPlan, NotificationSink, TracingSink, UpdateOrchestrator,
};
use upstage::poll::Poller;
use upstage::polkit::{self, PolkitAuthority};
use upstage::process::{SysinfoProbe, SystemProcessRunner};
use upstage::signing::SigningKeyPair;
use upstage::status::{StatusStore, UpdateStatus};
use upstage::verify::TreeVerifier;

#[derive(Parser)]
#[command(name = "upstage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive an external updater through an update attempt and verify the result")]
struct Cli {
    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    silent: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the update attempt described by upstage.toml
    Apply {
        /// Path to upstage.toml (default: ./upstage.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Check a tree against a JSON manifest
    Verify {
        /// Manifest file
        manifest: PathBuf,

        /// Tree root the manifest is relative to
        #[arg(short, long)]
        root: PathBuf,

        /// Directory holding compare_file references (default: tree root)
        #[arg(long)]
        reference_dir: Option<PathBuf>,

        /// Extra directories to scan for leftover artifacts
        #[arg(long = "scan")]
        scan: Vec<PathBuf>,
    },

    /// Show the status and version tokens of an updates directory
    Status {
        updates_dir: PathBuf,
    },

    /// Create a template upstage.toml in the current directory
    Init {
        /// Updater binary to put in the template
        #[arg(long, default_value = "./bin/updater")]
        updater: String,

        /// Overwrite an existing upstage.toml
        #[arg(short, long)]
        force: bool,
    },

    /// Key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Sign binaries, writing <binary>.sig next to each
    Sign {
        /// Private key file
        #[arg(short, long)]
        key: PathBuf,

        binaries: Vec<PathBuf>,
    },

    /// Install the polkit policy file (requires root)
    InstallPolicy,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Generate a new Ed25519 signing keypair
    Generate {
        /// Output path for the key file
        #[arg(short, long, default_value = "upstage-signing.key")]
        output: PathBuf,
    },
}

// Console helper for output control
struct Console {
    silent: bool,
}

impl Console {
    fn new(silent: bool) -> Self {
        Self { silent }
    }

    fn log(&self, msg: impl std::fmt::Display) {
        if !self.silent {
            println!("{}", msg);
        }
    }

    fn success(&self, msg: impl std::fmt::Display) {
        if !self.silent {
            println!("✅ {}", msg);
        }
    }

    fn warn(&self, msg: impl std::fmt::Display) {
        if !self.silent {
            eprintln!("⚠️  {}", msg);
        }
    }

    fn error(&self, msg: impl std::fmt::Display) {
        eprintln!("❌ {}", msg);
    }

    fn spinner(&self, msg: &str) -> Option<ProgressBar> {
        if self.silent {
            return None;
        }

        let pb = ProgressBar::new_spinner();
        let template = "{spinner:.green} [{elapsed_precise}] {msg}";
        if let Ok(style) = ProgressStyle::with_template(template) {
            pb.set_style(style);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}

/// Shows the polled status on a spinner, then hands off to tracing
struct SpinnerSink {
    spinner: Option<ProgressBar>,
}

impl NotificationSink for SpinnerSink {
    fn on_status(&self, status: &UpdateStatus) {
        match self.spinner {
            Some(ref pb) => pb.set_message(format!("Update status: {}", status)),
            None => TracingSink.on_status(status),
        }
    }

    fn on_complete(&self, outcome: &AttemptOutcome) {
        if let Some(ref pb) = self.spinner {
            pb.finish_and_clear();
        }
        TracingSink.on_complete(outcome);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.silent {
        "error"
    } else {
        "info"
    };
    let _ = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .without_time()
        .try_init();

    let console = Console::new(cli.silent);

    match cli.command {
        Commands::Apply { config } => cmd_apply(config, &console),
        Commands::Verify {
            manifest,
            root,
            reference_dir,
            scan,
        } => cmd_verify(&manifest, &root, reference_dir.as_deref(), &scan, &console),
        Commands::Status { updates_dir } => cmd_status(&updates_dir, &console),
        Commands::Init { updater, force } => cmd_init(&updater, force, &console),
        Commands::Key { action } => match action {
            KeyAction::Generate { output } => cmd_key_generate(&output, &console),
        },
        Commands::Sign { key, binaries } => cmd_sign(&key, &binaries, &console),
        Commands::InstallPolicy => cmd_install_policy(&console),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Run one update attempt
fn cmd_apply(config_path: Option<PathBuf>, console: &Console) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_current_dir()?,
    };
    config.validate()?;

    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let plan = AttemptPlan::from_config(&config).await?;
        let runner = Arc::new(SystemProcessRunner::new());

        let spinner = console.spinner(&format!("Applying {}...", plan.archive.display()));
        let mut orchestrator = UpdateOrchestrator::new(runner.clone())
            .with_env_store(Arc::new(ProcessEnv))
            .with_sink(Arc::new(SpinnerSink { spinner }));

        if config.attempt.use_service {
            orchestrator = orchestrator.with_elevation(elevation_for(&config, runner)?);
        }

        anyhow::Ok(orchestrator.run(&plan).await)
    })?;

    match outcome {
        AttemptOutcome::Success(summary) => {
            console.success(format!(
                "Update finished with status {} in {:.1?}",
                summary.final_status, summary.elapsed
            ));
            Ok(())
        }
        AttemptOutcome::Failure(problems) => {
            for problem in &problems {
                console.error(problem);
                if let upstage::UpdateError::Verification(mismatches) = problem {
                    for mismatch in mismatches {
                        console.log(format!("   {}", mismatch));
                    }
                }
            }
            anyhow::bail!("Update attempt failed with {} problem(s)", problems.len())
        }
    }
}

fn elevation_for(
    config: &Config,
    runner: Arc<SystemProcessRunner>,
) -> Result<ElevationCoordinator> {
    let bin_dir = config
        .service
        .bin_dir
        .clone()
        .context("[service] bin_dir is required for the service path")?;
    let log_path = config
        .service_log_path()
        .context("Could not determine the service log location")?;

    let mut settings = ServiceSettings::new(bin_dir, log_path);
    if !config.service.launch_command.is_empty() {
        settings.launch_command = config.service.launch_command.iter().map(Into::into).collect();
    }
    settings.trusted_public_key = config.service.trusted_public_key.clone();
    settings.upgrade_installer = config.service.upgrade_installer;
    settings.barrier = Poller::iterations(
        config.timeouts.barrier_interval(),
        config.timeouts.barrier_iterations,
    );

    Ok(ElevationCoordinator::new(
        settings,
        runner,
        Arc::new(SysinfoProbe),
        Arc::new(PolkitAuthority),
    ))
}

/// Check a tree against a manifest
fn cmd_verify(
    manifest_path: &Path,
    root: &Path,
    reference_dir: Option<&Path>,
    scan: &[PathBuf],
    console: &Console,
) -> Result<()> {
    let manifest = runtime()?.block_on(TreeManifest::load(manifest_path))?;
    console.log(format!(
        "🔍 Verifying {} against {} expectation(s)\n",
        root.display(),
        manifest.len()
    ));

    let verifier = TreeVerifier::new(root, reference_dir.unwrap_or(root));
    let extra: Vec<&Path> = scan.iter().map(PathBuf::as_path).collect();
    let mismatches = verifier.verify_all(&manifest, &extra);

    if mismatches.is_empty() {
        console.success("Tree matches the manifest");
        return Ok(());
    }

    for mismatch in &mismatches {
        console.error(mismatch);
    }
    anyhow::bail!("{} mismatch(es) found", mismatches.len())
}

/// Print the status and version tokens
fn cmd_status(updates_dir: &Path, console: &Console) -> Result<()> {
    let store = StatusStore::new(updates_dir);

    let token = store.read_status_token()?;
    match UpdateStatus::parse(&token) {
        Ok(status) => console.log(format!(
            "Status:  {}{}",
            status,
            if status.is_terminal() { " (terminal)" } else { "" }
        )),
        Err(_) => console.warn(format!("Unrecognized status token: {:?}", token)),
    }

    match store.read_version() {
        Ok(version) => console.log(format!("Version: {}", version)),
        Err(e) => console.warn(e),
    }

    Ok(())
}

/// Write a template upstage.toml
fn cmd_init(updater: &str, force: bool, console: &Console) -> Result<()> {
    let path = std::env::current_dir()?.join(config::CONFIG_FILE);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::write(&path, config::generate_template(updater))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    console.success(format!("Created {}", path.display()));
    Ok(())
}

fn cmd_key_generate(output: &Path, console: &Console) -> Result<()> {
    if output.exists() {
        anyhow::bail!("Key file already exists: {}", output.display());
    }

    console.log("🔑 Generating Ed25519 keypair...");
    let keypair = SigningKeyPair::generate();
    keypair.save(output)?;

    console.success("Keypair generated!");
    console.log(format!("   Private key: {}", output.display()));
    console.log(format!("   Public key:  {}", keypair.public_key_base64()));
    console.warn("Keep your private key secure and never commit it to git!");
    Ok(())
}

fn cmd_sign(key: &Path, binaries: &[PathBuf], console: &Console) -> Result<()> {
    if binaries.is_empty() {
        anyhow::bail!("No binaries given to sign");
    }

    let keypair = SigningKeyPair::load(key)?;
    for binary in binaries {
        let sig = keypair.sign_file(binary)?;
        console.success(format!("Signed {} -> {}", binary.display(), sig.display()));
    }
    console.log(format!("Public key: {}", keypair.public_key_base64()));
    Ok(())
}

/// Install the polkit policy file for the service installer action
fn cmd_install_policy(console: &Console) -> Result<()> {
    if !polkit::is_root() {
        anyhow::bail!(
            "Installing the polkit policy requires root privileges.\n\
             Run with sudo:\n  sudo {} install-policy",
            std::env::current_exe()?.display()
        );
    }

    if polkit::install_policy_file(Path::new(polkit::POLICY_FILE_PATH))? {
        console.success(format!("Polkit policy installed to {}", polkit::POLICY_FILE_PATH));
    } else {
        console.log(format!("Polkit policy already exists at {}", polkit::POLICY_FILE_PATH));
    }
    Ok(())
}
