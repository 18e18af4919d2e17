//! bodman - minimal rootful OCI container runner.
//!
//! ```sh
//! bodman pull docker.io/library/alpine
//! bodman run -v /srv/data:/data alpine /bin/sh -c 'echo hello'
//! bodman images
//! bodman images rm alpine
//! bodman gc
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};

use bodman::constants::{DEFAULT_BASE_DIR, DEFAULT_CNI_CONFIG_DIR, DEFAULT_CNI_PLUGIN_DIRS};
use bodman::launcher::{self, NamespaceMode, RunConfig};
use bodman::puller;
use bodman::store::Store;
use bodman::{Error, Result};

/// bodman - pull OCI images and run one-shot containers.
#[derive(Parser, Debug)]
#[command(name = "bodman", version, about, long_about = None)]
struct Cli {
    /// Base directory for the image store and container workdirs.
    #[arg(long, global = true, default_value = DEFAULT_BASE_DIR)]
    base_directory: PathBuf,

    /// CNI network configuration directory.
    #[arg(long, global = true, default_value = DEFAULT_CNI_CONFIG_DIR)]
    cni_config_dir: PathBuf,

    /// CNI plugin directory (repeatable).
    #[arg(long, global = true)]
    cni_plugin_dir: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch an image and store it locally.
    Pull {
        /// Image reference, e.g. docker.io/library/alpine.
        image: String,
        /// Suppress progress output.
        #[arg(long)]
        quiet: bool,
    },
    /// Run a one-shot container from a stored image.
    Run(RunArgs),
    /// List stored images, or manage them via a subcommand.
    Images {
        #[command(subcommand)]
        command: Option<ImagesCommand>,
    },
    /// Remove dead container workdirs and prune unreferenced store objects.
    Gc,
}

#[derive(Subcommand, Debug)]
enum ImagesCommand {
    /// Delete an image reference; objects are reclaimed by the next gc.
    Rm { image: String },
}

// -h is the hostname shorthand here, so the automatic help flag is
// re-declared long-only.
#[derive(Args, Debug)]
#[command(disable_help_flag = true)]
struct RunArgs {
    /// Image reference to run.
    image: String,

    /// Command and arguments; override the image cmd.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Nameserver for the container's resolv.conf (repeatable).
    #[arg(long)]
    dns: Vec<String>,

    /// resolv.conf options line entry (repeatable).
    #[arg(long, visible_alias = "dns-opt")]
    dns_option: Vec<String>,

    /// resolv.conf search domain (repeatable).
    #[arg(long)]
    dns_search: Vec<String>,

    /// Environment variable KEY=VALUE (repeatable).
    #[arg(long, short = 'e')]
    env: Vec<String>,

    /// Container hostname; defaults to the first UUID segment.
    #[arg(long, short = 'h')]
    hostname: Option<String>,

    /// IPC namespace mode.
    #[arg(long, value_parser = parse_namespace_mode, default_value = "private")]
    ipc: NamespaceMode,

    /// Network: host, none, or a CNI configuration name.
    #[arg(long, visible_alias = "net", default_value = "host")]
    network: String,

    /// Publish ports: [hostIP:]hostPort[-end]:ctrPort[-end][/proto] (repeatable).
    #[arg(long, short = 'p')]
    publish: Vec<String>,

    /// Namespaced sysctl KEY=VALUE (repeatable).
    #[arg(long)]
    sysctl: Vec<String>,

    /// Propagate LISTEN_PID, LISTEN_FDS, LISTEN_FDNAMES.
    #[arg(long)]
    systemd_activation: bool,

    /// User name or uid to run as.
    #[arg(long, short = 'u')]
    user: Option<String>,

    /// UTS namespace mode.
    #[arg(long, value_parser = parse_namespace_mode, default_value = "private")]
    uts: NamespaceMode,

    /// Bind mount src:dest[:opts] (repeatable).
    #[arg(long, short = 'v')]
    volume: Vec<String>,

    /// Working directory inside the container.
    #[arg(long, short = 'w')]
    workdir: Option<String>,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn parse_namespace_mode(value: &str) -> std::result::Result<NamespaceMode, String> {
    match value {
        "private" => Ok(NamespaceMode::Private),
        "host" => Ok(NamespaceMode::Host),
        other => Err(format!("expected 'private' or 'host', got '{}'", other)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bodman: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let store = Store::open(&cli.base_directory)?;
    let cni_plugin_dirs = if cli.cni_plugin_dir.is_empty() {
        DEFAULT_CNI_PLUGIN_DIRS.iter().map(PathBuf::from).collect()
    } else {
        cli.cni_plugin_dir
    };

    match cli.command {
        Command::Pull { image, quiet } => {
            let mut stdout = std::io::stdout();
            let progress: Option<&mut dyn Write> =
                if quiet { None } else { Some(&mut stdout) };
            puller::pull(&store, &image, progress).await
        }
        Command::Run(args) => {
            let cfg = RunConfig {
                image: args.image,
                command: args.command,
                dns: args.dns,
                dns_options: args.dns_option,
                dns_search: args.dns_search,
                env: args.env,
                hostname: args.hostname,
                network: args.network,
                publish: args.publish,
                sysctls: args.sysctl,
                systemd_activation: args.systemd_activation,
                user: args.user,
                volumes: args.volume,
                workdir: args.workdir,
                ipc: args.ipc,
                uts: args.uts,
                cni_config_dir: cli.cni_config_dir,
                cni_plugin_dirs,
            };
            // Returns only on failure; success replaces this process.
            launcher::run(&store, &cfg).map(|_| ())
        }
        Command::Images { command: None } => {
            for image in store.list_images()? {
                println!("{}", image);
            }
            Ok(())
        }
        Command::Images {
            command: Some(ImagesCommand::Rm { image }),
        } => store.delete_image(&image),
        Command::Gc => {
            let summary = store.gc()?;
            for removed in &summary.removed {
                eprintln!("removed {}", removed.display());
            }
            if summary.errors.is_empty() {
                Ok(())
            } else {
                for error in &summary.errors {
                    eprintln!("bodman: gc: {}", error);
                }
                Err(Error::Store(format!(
                    "gc completed with {} errors",
                    summary.errors.len()
                )))
            }
        }
    }
}
