use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use dind_init::config::{BootstrapConfig, RunArgs};
use dind_init::host::LinuxHost;
use dind_init::subnet::{derive_bridge_subnet, parse_cidr};
use dind_init::{BootstrapError, bootstrap, fds};
use std::convert::Infallible;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "dind-init")]
#[command(about = "Docker-in-Docker container bootstrap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the container, start the inner daemon, then exec a command
    Run(RunArgs),
    /// Print the inner bridge subnet a given offset produces
    Subnet {
        /// Current interface address, e.g. 172.17.0.2/16
        #[arg(long)]
        cidr: String,

        /// Offset applied within the containing network
        #[arg(long, default_value = "0.0.0.0")]
        offset: Ipv4Addr,

        /// Prefix length of the resulting subnet
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u8).range(0..=32))]
        size: u8,

        /// Print every intermediate value as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "Ignoring unreadable .env file");
        }
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            // configuration errors share the bootstrap's exit status
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<BootstrapError>()
                .map(BootstrapError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            let cfg = BootstrapConfig::from(args);
            run(cfg)?;
        }
        Commands::Subnet { cidr, offset, size, json } => {
            let derived = derive_bridge_subnet(parse_cidr(&cidr)?, offset, size)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&derived)?);
            } else {
                println!("{}", derived.fixed_cidr);
            }
        }
    }
    Ok(())
}

fn run(cfg: BootstrapConfig) -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root, mounts and bridging will most likely fail");
    }

    let sealed = fds::seal_inherited_fds()?;
    debug!(count = sealed, "Inherited descriptors marked close-on-exec");

    // single-threaded, and only once inherited descriptors are sealed
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let daemon = runtime.block_on(bootstrap::run(&LinuxHost, &cfg))?;
    info!(pid = ?daemon.id(), "Inner docker is up");

    match exec_command(&cfg.command)? {}
}

fn default_shell() -> String {
    if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

/// Replace this process with `command`, or an interactive shell.
fn exec_command(command: &[String]) -> anyhow::Result<Infallible> {
    let argv = if command.is_empty() {
        vec![default_shell()]
    } else {
        command.to_vec()
    };

    let cargs = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Invalid command argument: {}", e))?;

    info!(command = ?argv, "Handing over to command");
    let err = match nix::unistd::execvp(&cargs[0], &cargs) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    anyhow::bail!("Failed to exec {}: {}", argv[0], err)
}
