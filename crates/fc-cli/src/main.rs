mod repl;
mod runtime;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use fc_core::config::Config;
use fc_core::types::Mode;

/// flexicli -- a locally-hosted multi-agent coding assistant.
#[derive(Parser)]
#[command(name = "flexicli", version, about)]
struct Cli {
    /// Project root to operate on.
    #[arg(short = 'p', long, default_value = ".")]
    project: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single prompt and exit.
    Run {
        /// The user prompt.
        #[arg(long)]
        prompt: String,
        /// Skip all interactive approval prompts (deny anything sensitive).
        #[arg(long, default_value_t = false)]
        non_interactive: bool,
        /// Token-budget mode for this run.
        #[arg(long)]
        mode: Option<String>,
    },
}

// Exit codes: 0 success, 1 unrecoverable error, 2 aborted by user,
// 3 configuration error.
const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    fc_telemetry::logging::init_logging("flexicli", "info");

    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let (mode_override, run_args) = match &cli.command {
        Some(Commands::Run {
            prompt,
            non_interactive,
            mode,
        }) => (mode.clone(), Some((prompt.clone(), *non_interactive))),
        None => (None, None),
    };

    if let Some(raw) = mode_override {
        match raw.parse::<Mode>() {
            Ok(mode) => config.mode = mode,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    let interactive = match &run_args {
        Some((_, non_interactive)) => !non_interactive,
        None => true,
    };

    let runtime = match runtime::Runtime::start(&cli.project, config, interactive).await {
        Ok(runtime) => runtime,
        Err(runtime::StartupError::Config(e)) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            eprintln!("startup failed: {e}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let code = match run_args {
        Some((prompt, _)) => runtime.run_once(&prompt).await,
        None => repl::run(runtime).await,
    };

    ExitCode::from(match code {
        runtime::Completion::Success => EXIT_OK,
        runtime::Completion::Error => EXIT_ERROR,
        runtime::Completion::Aborted => EXIT_ABORTED,
    })
}
