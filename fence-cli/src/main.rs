//! CLI for the fence syscall mediation host.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

#[cfg(unix)]
mod run;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use fence::{Host, HostConfig, Manifest};

#[derive(Parser)]
#[command(name = "fence", version, about = "Capability-checked syscall host for sandboxed functions")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a local process as one invocation, bridged over an inherited socket.
    #[cfg(unix)]
    Run(run::RunArgs),

    /// Serve one invocation per connection on a Unix socket.
    #[cfg(unix)]
    Serve(ServeArgs),

    /// Validate a manifest and show the grants it yields.
    Check {
        /// Manifest file.
        manifest: PathBuf,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Settings shared by every command that hosts invocations.
#[derive(clap::Args)]
pub(crate) struct HostArgs {
    /// Function manifest (JSON).
    #[arg(long, short = 'm')]
    manifest: PathBuf,

    /// Directory guest paths resolve under.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Persist inter-invocation state in this JSON file.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Outbound connect timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,
}

impl HostArgs {
    /// Loads the manifest and builds the host.
    pub(crate) fn open(&self) -> Result<(Host, Manifest)> {
        let manifest = load(&self.manifest)?;
        let mut config = HostConfig::new(&self.root)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if let Some(state) = &self.state {
            config = config.state_file(state);
        }
        let host = Host::new(config).context("starting host")?;
        Ok((host, manifest))
    }
}

#[cfg(unix)]
#[derive(clap::Args)]
struct ServeArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Socket path to listen on.
    #[arg(long)]
    socket: PathBuf,
}

/// Output format for `check`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")
        .and_then(|rt| rt.block_on(cli.dispatch()));
    if let Err(e) = result {
        eprintln!("fence: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            #[cfg(unix)]
            Command::Run(args) => run::run(args).await,
            #[cfg(unix)]
            Command::Serve(args) => serve(args).await,
            Command::Check { manifest, format } => check(&manifest, format),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "fence", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

fn load(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("loading manifest {}", path.display()))
}

/// Shuts `host` down on Ctrl-C.
pub(crate) fn shutdown_on_interrupt(host: &Host) {
    let host = host.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            host.shutdown();
        }
    });
}

#[cfg(unix)]
async fn serve(args: ServeArgs) -> Result<()> {
    let (host, manifest) = args.host.open()?;
    shutdown_on_interrupt(&host);
    host.listen_unix(&args.socket, manifest)
        .await
        .with_context(|| format!("serving on {}", args.socket.display()))
}

fn check(path: &Path, format: OutputFormat) -> Result<()> {
    let manifest = load(path)?;
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    let caps = manifest.capabilities()?;
    println!("function: {}", manifest.name);
    println!("timeout:  {}ms", manifest.timeout_ms);
    if caps.grants().is_empty() {
        println!("No grants.");
    } else {
        println!("{:<12} {:<40} {:>8}", "OP", "SCOPE", "MAX_OPEN");
        for grant in caps.grants() {
            let max = grant
                .quota()
                .map_or_else(|| "-".to_owned(), |q| q.capacity().to_string());
            println!("{:<12} {:<40} {:>8}", grant.class().to_string(), grant.scope().to_string(), max);
        }
    }
    let limit = |n: Option<u64>| n.map_or_else(|| "unlimited".to_owned(), |n| format!("{n} bytes"));
    println!("write:    {}", limit(manifest.limits.write_bytes));
    println!("send:     {}", limit(manifest.limits.send_bytes));
    Ok(())
}
