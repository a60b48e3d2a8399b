use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};

use script_shell::bus::{LogKind, LogSurface};
use script_shell::config::{self, ShellConfig};
use script_shell::error::ResultExt;
use script_shell::logging;
use script_shell::serve;
use script_shell::shell::{self, ExecOutcome, JsonlSurface, ScriptShell};

/// Longest `run` waits for piped log lines after the script exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "script-shell", version, about = "Run scripts and route their logs, progress and settings")]
struct Cli {
    /// Config file (default: <home>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one script, streaming its log to stdout, and exit with its code
    Run { script: String },
    /// Answer JSONL requests on stdin; responses and UI events go to stdout
    Serve,
    /// Delete log files older than the retention window
    CleanLogs {
        #[arg(long)]
        days: Option<i64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match config::load_config_from(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("script-shell: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => config::load_config(),
    };
    let _guard = logging::init(&config);

    let result = match cli.command {
        Command::Run { script } => run(config, &script),
        Command::Serve => serve_stdio(config).map(|_| ExitCode::SUCCESS),
        Command::CleanLogs { days } => clean_logs(config, days).map(|_| ExitCode::SUCCESS),
    };
    result.unwrap_or_else(|e| {
        logging::log_error("CLI", &format!("{:#}", e), None);
        ExitCode::FAILURE
    })
}

fn run(config: ShellConfig, script: &str) -> Result<ExitCode> {
    let shell = ScriptShell::new(config, Arc::new(LogSurface));
    let exit = match shell.exec_script(script)? {
        ExecOutcome::Started { exit, .. } => exit,
        ExecOutcome::StillRunning => anyhow::bail!("{} still running", script),
    };
    // A closed stdout (`run x | head`) drops lines instead of panicking
    shell.start_log_stream_with(|message| {
        let written = match message.kind {
            LogKind::Log => writeln!(io::stdout().lock(), "{}", message.text()),
            LogKind::Err => writeln!(io::stderr().lock(), "{}", message.text()),
        };
        written.warn_on_err();
    });

    let code = exit.recv_blocking().context("script exit was never reported")?;
    let log = shell.context().log();
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while log.backlog() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(shell.context().config().pipe_interval_ms));
    }
    if log.backlog() > 0 {
        warn!(remaining = log.backlog(), "Log stream did not drain before exit");
    }
    shell.shutdown();

    info!(script = %script, exit_code = code, "Script run finished");
    Ok(match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    })
}

fn serve_stdio(config: ShellConfig) -> Result<()> {
    let out = Arc::new(Mutex::new(io::stdout()));
    let shell = ScriptShell::new(config, Arc::new(JsonlSurface::new(Arc::clone(&out))));
    serve::serve(shell, BufReader::new(io::stdin()), out);
    Ok(())
}

fn clean_logs(mut config: ShellConfig, days: Option<i64>) -> Result<()> {
    if let Some(days) = days {
        config.log_retention_days = days;
        config.validate()?;
    }
    let removed = shell::clean_logs(&config)?;
    println!("removed {} expired log file(s)", removed);
    Ok(())
}
