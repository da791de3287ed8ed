//! qlaunch CLI.
//!
//! ```text
//! qlaunch run --image os.iso
//! qlaunch run --config run.toml --no-gdb -- -m 512M
//! qlaunch command --target kernel --build-dir build --product build/kernel.iso
//! qlaunch executables
//! qlaunch kill-active
//! ```
//!
//! Without `--config`, sessions of separate invocations share the marker at
//! `<home>/qemu.pid`, so a new `run` replaces the previous VM unless
//! `--allow-parallel` is given.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use qlaunch::{
    BuildBackend, BuildProject, BuildTargetRef, CmakeBackend, DiskImageSource, Launcher,
    LauncherOptions, OutputKind, PidMarker, RunCommandLine, RunConfigFile, SessionConfig,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const MARKER_FILE_NAME: &str = "qemu.pid";

#[derive(Parser)]
#[command(name = "qlaunch")]
#[command(about = "Build a disk image and boot it in QEMU.", long_about = None)]
#[command(version)]
struct Cli {
    /// State directory for logs and the PID marker (default: ~/.qlaunch)
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (optionally) and run a VM, relaying its output
    Run(RunArgs),
    /// Print the QEMU command line a run would use
    Command(SessionArgs),
    /// List QEMU system emulators found on this machine
    Executables,
    /// Kill the VM recorded in the PID marker
    KillActive {
        #[arg(long, value_name = "PATH")]
        marker: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Print the session outcome as JSON when done
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SessionArgs {
    /// TOML run configuration
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// QEMU executable (default: first discovered qemu-system-*)
    #[arg(long, value_name = "PATH")]
    executable: Option<PathBuf>,

    /// Boot an existing disk image
    #[arg(long, value_name = "PATH", conflicts_with = "target")]
    image: Option<PathBuf>,

    /// Build this target and boot its product
    #[arg(long, value_name = "NAME")]
    target: Option<String>,

    /// CMake build directory for --target
    #[arg(long, value_name = "DIR", requires = "product")]
    build_dir: Option<PathBuf>,

    /// Disk image produced by --target
    #[arg(long, value_name = "PATH", requires = "build_dir")]
    product: Option<PathBuf>,

    /// gdb stub port
    #[arg(long, value_name = "PORT", conflicts_with = "no_gdb")]
    gdb: Option<u16>,

    /// Disable the gdb stub
    #[arg(long)]
    no_gdb: bool,

    /// Freeze the CPU until a debugger attaches
    #[arg(long, conflicts_with = "no_wait_gdb")]
    wait_gdb: bool,

    /// Start the CPU immediately
    #[arg(long)]
    no_wait_gdb: bool,

    /// Keep a previously launched VM running
    #[arg(long)]
    allow_parallel: bool,

    /// PID marker file (default: <home>/qemu.pid)
    #[arg(long, value_name = "PATH")]
    marker: Option<PathBuf>,

    /// Extra QEMU arguments
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,
}

/// Session settings after merging the config file and flags.
struct Resolved {
    config: SessionConfig,
    build: Option<BuildProject>,
    marker: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match try_main(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("qlaunch: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn try_main(cli: Cli) -> Result<ExitCode> {
    let home = match cli.home {
        Some(home) => std::path::absolute(&home)
            .with_context(|| format!("resolve home directory: {}", home.display()))?,
        None => qlaunch::default_home_dir(),
    };

    qlaunch::init_logging(&home.join("logs")).context("initialize logging")?;

    match cli.command {
        Commands::Run(args) => run(&home, args).await,
        Commands::Command(args) => print_command(&home, args),
        Commands::Executables => list_executables(),
        Commands::KillActive { marker } => {
            let marker = PidMarker::at(marker_path(&home, marker)?);
            let recorded = marker.read_active();
            if marker.kill_previously_active() {
                println!("killed {}", recorded.unwrap_or_default());
            } else {
                println!("no active VM");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(home: &Path, args: RunArgs) -> Result<ExitCode> {
    let resolved = resolve(home, args.session)?;

    let launcher = Launcher::new(LauncherOptions {
        marker_path: Some(resolved.marker),
        build: resolved.build,
    })?;

    let session = launcher.start(resolved.config);
    tracing::info!(session_id = %session.id(), "Session launched from CLI");

    let mut output = session
        .take_output()
        .context("session output already taken")?;
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = output.next().await {
            let written = match chunk.kind {
                OutputKind::Stdout => write_flushed(&mut stdout, &chunk.text).await,
                OutputKind::Stderr => write_flushed(&mut stderr, &chunk.text).await,
            };
            if let Err(e) = written {
                tracing::debug!(error = %e, "Failed to print session output");
            }
        }
    });

    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(session_id = %session.id(), "Ctrl-C received, terminating session");
                session.terminate();
            }
        })
    };

    let outcome = session.wait().await?;
    interrupt.abort();
    let _ = printer.await;

    tracing::info!(
        session_id = %outcome.session_id,
        phase = %outcome.phase,
        elapsed_ms = outcome.elapsed().num_milliseconds(),
        "Session done"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if let Some(failure) = &outcome.failure {
        eprintln!("qlaunch: {} ({})", outcome.phase, failure);
    }

    if outcome.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1)))
    }
}

async fn write_flushed<W>(out: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(text.as_bytes()).await?;
    out.flush().await
}

fn print_command(home: &Path, args: SessionArgs) -> Result<ExitCode> {
    let resolved = resolve(home, args)?;
    let config = &resolved.config;

    let image = match config.disk_image {
        DiskImageSource::DirectFile => config
            .direct_file
            .clone()
            .context("no disk image file configured")?,
        DiskImageSource::BuildTarget => {
            let target = config
                .build_target
                .as_ref()
                .context("no build target selected")?;
            let project = resolved
                .build
                .context("no build project configured for --target")?;
            CmakeBackend::new(project).resolve(target)?.product
        }
    };

    let line = RunCommandLine::build(config, &std::path::absolute(&image)?, Some(&resolved.marker));
    println!("{}", line);
    Ok(ExitCode::SUCCESS)
}

fn list_executables() -> Result<ExitCode> {
    let found = qlaunch::find_qemu_executables();
    if found.is_empty() {
        eprintln!("no qemu-system-* executables found");
        return Ok(ExitCode::FAILURE);
    }
    for path in found {
        println!("{}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve(home: &Path, args: SessionArgs) -> Result<Resolved> {
    let file = match &args.config {
        Some(path) => RunConfigFile::load(path)?,
        None => RunConfigFile::default(),
    };
    let mut config = file.session;
    let mut build = file.build;

    if let Some(executable) = args.executable {
        config.executable = executable;
    }
    if config.executable.as_os_str().is_empty() {
        config.executable = qlaunch::find_qemu_executables()
            .into_iter()
            .next()
            .context("no QEMU executable given and none found; pass --executable")?;
    } else if config.executable.components().count() == 1
        && !qlaunch::util::can_execute(&config.executable.to_string_lossy())
    {
        tracing::warn!(executable = %config.executable.display(), "QEMU executable not found on PATH");
    }

    if let Some(image) = args.image {
        config.disk_image = DiskImageSource::DirectFile;
        config.direct_file = Some(std::path::absolute(&image)?);
    }
    if let Some(target) = args.target {
        config.disk_image = DiskImageSource::BuildTarget;
        config.build_target = Some(BuildTargetRef::new(target.clone()));
        if let (Some(build_dir), Some(product)) = (args.build_dir, args.product) {
            let cwd = std::env::current_dir().context("read current directory")?;
            build = Some(BuildProject::new(cwd, build_dir).with_target(target, product));
        }
    }
    if args.config.is_none() && config.disk_image == DiskImageSource::BuildTarget && build.is_none()
    {
        bail!("either --image or --target with --build-dir/--product is required");
    }

    if let Some(port) = args.gdb {
        config.debug.enabled = true;
        config.debug.tcp_port = port;
    }
    if args.no_gdb {
        config.debug.enabled = false;
    }
    if args.wait_gdb {
        config.debug.wait_for_attach = true;
    }
    if args.no_wait_gdb {
        config.debug.wait_for_attach = false;
    }
    if args.allow_parallel {
        config.allow_parallel = true;
    }
    if !args.args.is_empty() {
        config.arguments = args.args.join(" ");
    }

    let marker = marker_path(home, args.marker)?;

    Ok(Resolved {
        config,
        build,
        marker,
    })
}

/// The marker path must match QEMU's `-pidfile` argument byte for byte, so
/// it is made absolute up front.
fn marker_path(home: &Path, marker: Option<PathBuf>) -> Result<PathBuf> {
    match marker {
        Some(path) => std::path::absolute(&path)
            .with_context(|| format!("resolve marker path: {}", path.display())),
        None => Ok(home.join(MARKER_FILE_NAME)),
    }
}
