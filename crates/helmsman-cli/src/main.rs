//! helmsman CLI
//!
//! Run commands on the local machine or on SSH hosts from the command line

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use helmsman_exec::{
    Command, CommandOptions, Error, ProcessError, Server, Signal, SilentError, Superuser,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "Run commands on local and remote hosts", long_about = None)]
struct Cli {
    /// Target host or `[[host]]` alias
    #[arg(long, short = 'H', global = true, default_value = "localhost")]
    host: String,

    /// Config file (overrides HELMSMAN_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    #[command(name = "run")]
    Run {
        #[command(flatten)]
        exec: ExecArgs,
        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run a bash script
    #[command(name = "bash")]
    Bash {
        #[command(flatten)]
        exec: ExecArgs,
        /// Script text
        script: String,
        /// Positional arguments ($1..)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Check that a host accepts commands
    #[command(name = "check")]
    Check,
    /// Show facts about a host
    #[command(name = "info")]
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct ExecArgs {
    /// Run through sudo, failing if that is not possible
    #[arg(long, conflicts_with = "try_sudo")]
    sudo: bool,
    /// Run through sudo when possible
    #[arg(long)]
    try_sudo: bool,
    /// Report non-zero exits as the exit code instead of an error
    #[arg(long)]
    allow_failure: bool,
    /// Working directory on the host
    #[arg(long)]
    cwd: Option<String>,
    /// Extra environment, KEY=VALUE
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,
    /// Allocate a pseudo-terminal (SSH only)
    #[arg(long)]
    pty: bool,
    /// Forward our stdin to the command
    #[arg(long)]
    stdin: bool,
    /// Kill the command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl ExecArgs {
    fn options(&self) -> CommandOptions {
        let mut options = CommandOptions {
            environ: self.env.clone(),
            pty: self.pty,
            ..CommandOptions::default()
        };
        if let Some(cwd) = &self.cwd {
            options = options.directory(cwd);
        }
        if self.sudo {
            options = options.superuser(Superuser::Require);
        } else if self.try_sudo {
            options = options.superuser(Superuser::Try);
        }
        options
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let (config, source) = Config::discover(cli.config.as_deref())?;
    init_tracing(&config.log_level, cli.log_format);
    match &source {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => warn!("no config file found, using defaults"),
    }

    let server = config.server(&cli.host);
    let outcome = tokio::select! {
        outcome = dispatch(&server, cli.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            Err(Error::from(SilentError::CancelledByUser("interrupted".to_string())).into())
        }
    };

    if let Err(e) = server.disconnect().await {
        debug!(error = %e, "disconnect failed");
    }

    match outcome {
        Ok(code) => Ok(code),
        Err(report) if is_silent(&report) => Ok(ExitCode::from(130)),
        Err(report) => Err(report),
    }
}

fn is_silent(report: &eyre::Report) -> bool {
    report.downcast_ref::<Error>().is_some_and(Error::is_silent)
}

async fn dispatch(server: &Server, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run { exec, argv } => {
            let command = Command::new(argv, exec.options())?;
            execute(server, command, &exec).await
        }
        Commands::Bash { exec, script, args } => {
            let command = Command::bash(&script, args, exec.options())?;
            execute(server, command, &exec).await
        }
        Commands::Check => check(server).await,
        Commands::Info { json } => info(server, json).await,
    }
}

async fn execute(server: &Server, command: Command, exec: &ExecArgs) -> Result<ExitCode> {
    let mut process = server.prepare(command);
    if exec.allow_failure {
        process.allow_failure();
    }
    let mut output = process.stream()?;
    process.start().await?;

    if exec.stdin {
        let mut input = Vec::new();
        tokio::io::stdin().read_to_end(&mut input).await?;
        process.input(input)?;
    }
    process.close_stdin();

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = output.recv().await {
            stdout.write_all(&chunk).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let killer = process.killer();
    let result = match exec.timeout.map(Duration::from_secs) {
        Some(limit) => match tokio::time::timeout(limit, process.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?limit, "command timed out, killing it");
                killer.kill(Signal::Term);
                process.wait().await
            }
        },
        None => process.wait().await,
    };
    printer.await??;

    match result {
        Ok(exited) => {
            eprint!("{}", exited.stderr());
            info!(process = %exited, duration = ?exited.duration(), "finished");
            let code = exited.exit_code().unwrap_or(1);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Err(ProcessError::NonZeroExit { message, exit_code }) => {
            error!("{message}");
            Ok(ExitCode::from(u8::try_from(exit_code).unwrap_or(1)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn check(server: &Server) -> Result<ExitCode> {
    match server.recheck_accessible().await {
        Ok(()) => {
            println!("{}: accessible", server.host());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn info(server: &Server, json: bool) -> Result<ExitCode> {
    server.is_accessible().await?;
    let hostname = server.hostname(true).await?;
    let ip_address = match server.ip_address(true).await {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(error = %e, "could not determine address");
            None
        }
    };
    let privilege = format!("{:?}", server.privilege().await?).to_lowercase();
    let session = server.session_type();

    if json {
        let facts = serde_json::json!({
            "host": server.host(),
            "session": session,
            "hostname": hostname,
            "ip_address": ip_address,
            "privilege": privilege,
        });
        println!("{}", serde_json::to_string_pretty(&facts)?);
    } else {
        println!("host:       {}", server.host());
        println!("session:    {session}");
        println!("hostname:   {hostname}");
        println!("ip_address: {}", ip_address.as_deref().unwrap_or("unknown"));
        println!("privilege:  {privilege}");
    }
    Ok(ExitCode::SUCCESS)
}
