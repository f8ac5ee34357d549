use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use wasi_demo_cli::logger;
use wasi_demo_cli::report::{OutputFormat, Report};
use wasi_demo_cli::runtime::{create_engine, exports, DemoHost, HostConfig, InvokeError};
use wasi_demo_cli::shutdown::{
    install_ctrlc, spawn_epoch_ticker, spawn_stdin_listener, spawn_watchdog, Shutdown,
};

#[derive(Parser, Debug)]
#[command(name = "wasi-demo")]
#[command(about = "Run the WASI demo modules under wasmtime")]
struct Args {
    #[arg(long, env = "WASI_DEMO_LOG", default_value = "info", global = true)]
    log_level: String,

    #[arg(long, value_enum, env = "WASI_DEMO_FORMAT", default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call `add(a, b)`
    Add {
        module: PathBuf,
        #[arg(allow_negative_numbers = true)]
        a: i32,
        #[arg(allow_negative_numbers = true)]
        b: i32,
    },

    /// Call `readFile()` with DIR mounted read-only at /usr/src/app
    ReadFile {
        module: PathBuf,
        #[arg(long, env = "WASI_DEMO_APP_DIR", default_value = ".")]
        app_dir: PathBuf,
    },

    /// Call `_start()` and keep it idling until Ctrl-C, `q`, or the timeout
    Start {
        module: PathBuf,
        #[arg(long, env = "WASI_DEMO_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },

    /// Store VALUE at LOCATION in guest memory and call `loadAndIncrement(LOCATION)`
    Increment {
        module: PathBuf,
        value: u32,
        location: u32,
    },
}

impl Command {
    fn module(&self) -> &Path {
        match self {
            Command::Add { module, .. }
            | Command::ReadFile { module, .. }
            | Command::Start { module, .. }
            | Command::Increment { module, .. } => module,
        }
    }

    fn app_dir(&self) -> Option<PathBuf> {
        match self {
            Command::ReadFile { app_dir, .. } => Some(app_dir.clone()),
            _ => None,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(&args.log_level)?;

    let engine = create_engine()?;
    let host = DemoHost::from_file(&engine, args.command.module())?;

    let shutdown = Arc::new(Shutdown::new());
    install_ctrlc(shutdown.clone())?;
    let epoch_thread = spawn_epoch_ticker(host.engine().clone(), shutdown.clone());

    let result = run(&host, &args, shutdown.clone());

    shutdown.request();
    let _ = epoch_thread.join();

    let report = result?;
    println!("{}", report.render(args.format)?);
    Ok(())
}

fn run(host: &DemoHost, args: &Args, shutdown: Arc<Shutdown>) -> Result<Report> {
    let config = HostConfig {
        app_dir: args.command.app_dir(),
        capture_stdout: args.format.captures_stdout(),
    };
    let mut session = host.session(&config, shutdown.clone())?;

    let report = match &args.command {
        Command::Add { a, b, .. } => {
            let sum = session.add(*a, *b).context("calling add")?;
            Report::returned(exports::ADD, Some(sum.into()), session.captured_stdout())
        }
        Command::ReadFile { .. } => {
            let code = session.read_file().context("calling readFile")?;
            Report::returned(exports::READ_FILE, Some(code.into()), session.captured_stdout())
        }
        Command::Increment {
            value, location, ..
        } => {
            let next = session
                .load_and_increment(*value, *location)
                .context("calling loadAndIncrement")?;
            Report::returned(
                exports::LOAD_AND_INCREMENT,
                Some(next.into()),
                session.captured_stdout(),
            )
        }
        Command::Start { timeout_ms, .. } => {
            spawn_stdin_listener(shutdown.clone());
            if let Some(ms) = timeout_ms {
                spawn_watchdog(shutdown.clone(), Duration::from_millis(*ms));
            }
            info!("guest idling, press Ctrl-C or q to stop");
            match session.start() {
                Ok(()) => Report::returned(exports::START, None, session.captured_stdout()),
                Err(InvokeError::Interrupted { .. }) => {
                    Report::interrupted(exports::START, session.captured_stdout())
                }
                Err(err) => return Err(err).context("calling _start"),
            }
        }
    };

    Ok(report)
}
