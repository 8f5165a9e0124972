use anyhow::{Context, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

use droid_pilot::agent::{CancelToken, RunRecorder, TurnController};
use droid_pilot::backend::{CurlTransport, ProviderKind, create_backend};
use droid_pilot::config::{self, Config};
use droid_pilot::device::{AdbDevice, DeviceError, DevicePort, MockDevice};
use droid_pilot::logging::{self, LogFormat};
use droid_pilot::runner::RunResult;
use droid_pilot::script::run_script;
use droid_pilot::session::{Session, SessionRecorder, cleanup_old_sessions, list_sessions};
use droid_pilot::spec::{TestSpec, load_spec, validate_for_agent};

/// Screen size of the dry-run mock device
const DRY_RUN_SIZE: (u32, u32) = (1080, 2400);

/// droid-pilot - goal-directed Android UI agent
#[derive(Parser, Debug)]
#[command(
    name = "droid-pilot",
    about = "Drive an Android app toward a natural-language goal with a vision decision backend",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DROID_PILOT_PROVIDER           Decision backend (openai, claude)\n\
        DROID_PILOT_MAX_TURNS          Turn budget per step\n\
        DROID_PILOT_ACTION_DELAY_MS    Delay after each action (ms)\n\
        DROID_PILOT_REPETITION_WINDOW  Loop guard window\n\
        DROID_PILOT_CANVAS             Virtual canvas declared to the backend (WxH)\n\
        DROID_PILOT_SERIAL             Target device serial\n\
        DROID_PILOT_REPORT_DIR         Base directory for run sessions\n\
        OPENAI_API_KEY, ANTHROPIC_API_KEY\n\
        RUST_LOG                       Log filter (default: info)"
)]
struct Args {
    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent loop on a test spec
    Run {
        /// Path to the test spec (JSON)
        spec: PathBuf,

        /// Decision backend (openai, claude)
        #[arg(long)]
        provider: Option<ProviderKind>,

        /// Turn budget per step
        #[arg(long)]
        max_turns: Option<u32>,

        /// Cumulative turn ceiling across steps
        #[arg(long)]
        max_total_turns: Option<u32>,

        /// Delay after each action in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Loop guard window size
        #[arg(long)]
        repetition_window: Option<usize>,

        /// Virtual canvas declared to the backend (WxH)
        #[arg(long)]
        canvas: Option<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Replay a command-list spec without a decision backend
    Script {
        /// Path to the test spec (JSON)
        spec: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Load a spec and print the resolved steps
    Validate {
        /// Path to the test spec (JSON)
        spec: PathBuf,

        /// Print the normalised spec as JSON
        #[arg(long)]
        json: bool,
    },

    /// List or prune run sessions
    Sessions {
        /// Remove sessions older than this many hours
        #[arg(long)]
        clean_older_than_hours: Option<u64>,
    },
}

/// Device and output options shared by `run` and `script`
#[derive(ClapArgs, Debug)]
struct TargetArgs {
    /// Device serial (first attached device by default)
    #[arg(long)]
    serial: Option<String>,

    /// Session directory (default: auto-generated under the report dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the run result as JSON
    #[arg(long)]
    json: bool,

    /// Use a mock device instead of adb
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(if args.json_logs { LogFormat::Json } else { LogFormat::Compact });

    match dispatch(args.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands) -> anyhow::Result<u8> {
    match command {
        Commands::Run {
            spec,
            provider,
            max_turns,
            max_total_turns,
            delay_ms,
            repetition_window,
            canvas,
            target,
        } => {
            let spec = read_spec(&spec)?;
            validate_for_agent(&spec).context("spec cannot be run by the agent")?;

            let mut config = Config::from_env();
            if let Some(provider) = provider {
                config.backend.provider = provider;
            }
            if let Some(canvas) = canvas {
                config.backend.canvas = Some(config::parse_canvas(&canvas)?);
            }
            let mut agent = config.agent.clone().max_total_turns(max_total_turns.or(config.agent.max_total_turns));
            if let Some(n) = max_turns {
                agent = agent.max_turns(n);
            }
            if let Some(ms) = delay_ms {
                agent = agent.action_delay(Duration::from_millis(ms));
            }
            if let Some(window) = repetition_window {
                agent = agent.repetition_window(window);
            }
            config.agent = agent;
            config.validate()?;

            let backend = create_backend(
                &config.backend,
                Box::new(CurlTransport::new(config.backend.connect_timeout)),
            )?;
            let device = match open_device(&config, &spec, &target) {
                Ok(device) => device,
                Err(e) => return report_setup_failure(&config, &spec, &target, Some(config.backend.provider), &e),
            };
            let recorder = open_recorder(
                &config,
                &spec,
                &target,
                json!({
                    "package": spec.package,
                    "provider": config.backend.provider,
                    "device": device.source_type(),
                }),
            )?;
            let session_dir = recorder.session().dir.clone();

            let cancel = watch_ctrl_c();
            let mut controller = TurnController::new(device, backend, recorder, config.agent.clone())
                .with_canvas(config.backend.canvas)
                .with_cancel(cancel);
            let result = tokio::task::spawn_blocking(move || controller.run(&spec))
                .await
                .context("agent loop panicked")?;

            report(&result, &session_dir, target.json)?;
            Ok(result.exit_code() as u8)
        }

        Commands::Script { spec, target } => {
            let spec = read_spec(&spec)?;
            if !spec.is_script() {
                return Err(anyhow!("spec has no command steps; use `run` for goal steps"));
            }
            let config = Config::from_env();
            let mut device = match open_device(&config, &spec, &target) {
                Ok(device) => device,
                Err(e) => return report_setup_failure(&config, &spec, &target, None, &e),
            };
            let mut recorder = open_recorder(
                &config,
                &spec,
                &target,
                json!({"package": spec.package, "device": device.source_type(), "mode": "script"}),
            )?;
            let session_dir = recorder.session().dir.clone();

            let cancel = watch_ctrl_c();
            let result = tokio::task::spawn_blocking(move || run_script(&mut device, &spec, &mut recorder, &cancel))
                .await
                .context("script runner panicked")?;

            report(&result, &session_dir, target.json)?;
            Ok(result.exit_code() as u8)
        }

        Commands::Validate { spec, json } => {
            let spec = read_spec(&spec)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&spec)?);
                return Ok(0);
            }
            print_spec(&spec);
            if !spec.is_script() {
                validate_for_agent(&spec)?;
            }
            Ok(0)
        }

        Commands::Sessions { clean_older_than_hours } => {
            let base = config::session_base_dir();
            if let Some(hours) = clean_older_than_hours {
                let removed = cleanup_old_sessions(&base, Duration::from_secs(hours * 3600))?;
                println!("Removed {} session(s) from {}", removed, base);
            }
            let sessions = list_sessions(&base)?;
            if sessions.is_empty() {
                println!("No sessions in {}", base);
            }
            for session in sessions {
                println!("{}", session.display());
            }
            Ok(0)
        }
    }
}

fn read_spec(path: &Path) -> anyhow::Result<TestSpec> {
    load_spec(path).with_context(|| format!("failed to load spec {}", path.display()))
}

fn open_device(config: &Config, spec: &TestSpec, target: &TargetArgs) -> Result<Box<dyn DevicePort>, DeviceError> {
    if target.dry_run {
        let (width, height) = DRY_RUN_SIZE;
        return Ok(Box::new(MockDevice::new(width, height).with_installed(spec.package.clone())));
    }
    let serial = target.serial.clone().or_else(|| config.device.serial.clone());
    let device = AdbDevice::connect(config.device.adb.clone(), serial)?;
    info!(serial = ?device.serial(), "device connected");
    Ok(Box::new(device))
}

/// Record and report a run that never reached the device.
fn report_setup_failure(
    config: &Config,
    spec: &TestSpec,
    target: &TargetArgs,
    provider: Option<ProviderKind>,
    error: &DeviceError,
) -> anyhow::Result<u8> {
    warn!(error = %error, "no device");
    let result = RunResult::setup_failed(spec.package.clone(), provider, error);
    let mut recorder = open_recorder(
        config,
        spec,
        target,
        json!({"package": spec.package, "provider": provider, "device": "adb"}),
    )?;
    recorder.finish(&result).context("failed to write run summary")?;
    report(&result, &recorder.session().dir, target.json)?;
    Ok(result.exit_code() as u8)
}

fn open_recorder(
    config: &Config,
    spec: &TestSpec,
    target: &TargetArgs,
    metadata: serde_json::Value,
) -> anyhow::Result<SessionRecorder> {
    let session = match &target.output {
        Some(dir) => Session::in_dir(dir),
        None => Session::with_name(&config.session.base_dir, spec.label()),
    };
    let dir = session.dir.clone();
    SessionRecorder::create(session, metadata)
        .with_context(|| format!("failed to create session directory {}", dir.display()))
}

/// Cancel the returned token on Ctrl-C.
fn watch_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current turn...");
            token.cancel();
        }
    });
    cancel
}

fn report(result: &RunResult, session_dir: &Path, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("{}", result.summary());
    for step in &result.steps {
        println!(
            "  Step {} [{}] {} turn(s): {}",
            step.index,
            step.outcome,
            step.turns,
            step.reason.as_deref().unwrap_or("-")
        );
    }
    println!("\nSession: {}", session_dir.display());
    Ok(())
}

fn print_spec(spec: &TestSpec) {
    println!("Package: {}", spec.package);
    if let Some(activity) = &spec.activity {
        println!("Activity: {}", activity);
    }
    if let Some(apk) = &spec.apk {
        println!("APK: {}", apk.display());
    }
    println!(
        "Install: skip={} uninstall_after={}",
        spec.install.skip_install, spec.install.uninstall_after
    );
    for (i, command) in spec.pre_steps.iter().enumerate() {
        println!("Pre-step {}: {}", i + 1, command.name());
    }
    if spec.is_script() {
        for (i, command) in spec.script.iter().enumerate() {
            println!("Command {}: {}", i + 1, command.name());
        }
        return;
    }
    for (i, step) in spec.steps.iter().enumerate() {
        println!("Step {}: {}", i + 1, step.goal);
        if !step.success_criteria.is_empty() {
            println!("  Success criteria: {}", step.success_criteria);
        }
    }
}
