use clap::{Args, ValueEnum};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const SECURITYFS: &str = "/sys/kernel/security";
pub const VAR_LIB_DOCKER: &str = "/var/lib/docker";
pub const LOOPBACK_IMAGE: &str = "/var/lib/docker.img";
pub const DAEMON_LOG: &str = "/var/log/docker.log";

/// Where the inner daemon's output goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogMode {
    /// Share the bootstrap's stdout/stderr
    #[default]
    Stdio,
    /// Append to /var/log/docker.log
    File,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Destination of the daemon's output
    #[arg(long, env = "LOG", value_enum, default_value_t = LogMode::Stdio)]
    pub log: LogMode,

    /// Size in GB of the loopback image used when overlay cannot nest
    #[arg(long, env = "VAR_LIB_DOCKER_SIZE", default_value_t = 5)]
    pub var_lib_docker_size: u64,

    /// Per-container offset (e.g. 0.0.1.0); enables bridging when set
    #[arg(long, env = "DOCKER_NETWORK_OFFSET")]
    pub network_offset: Option<Ipv4Addr>,

    /// Prefix length of the subnet handed to the inner bridge
    #[arg(long, env = "DOCKER_NETWORK_SIZE", default_value_t = 24,
          value_parser = clap::value_parser!(u8).range(0..=32))]
    pub network_size: u8,

    /// Extra flags appended to the daemon command line
    #[arg(long, env = "DOCKER_DAEMON_ARGS", default_value = "", allow_hyphen_values = true)]
    pub daemon_args: String,

    /// Daemon executable
    #[arg(long, env = "DOCKER_DAEMON_BIN", default_value = "dockerd")]
    pub daemon_bin: String,

    /// Name of the bridge the inner daemon attaches containers to
    #[arg(long, env = "DOCKER_BRIDGE", default_value = "docker0")]
    pub bridge: String,

    /// Seconds to wait for `docker info` to succeed
    #[arg(long, env = "DIND_READY_TIMEOUT", default_value_t = 60)]
    pub ready_timeout: u64,

    /// Command to exec once the daemon is up (defaults to a shell)
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Resolved settings for one bootstrap run.
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub var_lib_docker: PathBuf,
    pub loopback_image: PathBuf,
    pub loopback_size_gb: u64,
    pub network: Option<NetworkConfig>,
    pub daemon: DaemonConfig,
    pub command: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    pub offset: Ipv4Addr,
    pub size: u8,
    pub bridge: String,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub program: String,
    pub extra_args: Vec<String>,
    pub log: LogMode,
    pub log_path: PathBuf,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<RunArgs> for BootstrapConfig {
    fn from(args: RunArgs) -> Self {
        let network = args.network_offset.map(|offset| NetworkConfig {
            offset,
            size: args.network_size,
            bridge: args.bridge.clone(),
        });

        BootstrapConfig {
            var_lib_docker: PathBuf::from(VAR_LIB_DOCKER),
            loopback_image: PathBuf::from(LOOPBACK_IMAGE),
            loopback_size_gb: args.var_lib_docker_size,
            network,
            daemon: DaemonConfig {
                program: args.daemon_bin,
                extra_args: split_daemon_args(&args.daemon_args),
                log: args.log,
                log_path: PathBuf::from(DAEMON_LOG),
                ready_timeout: Duration::from_secs(args.ready_timeout),
                poll_interval: Duration::from_secs(1),
            },
            command: args.command,
        }
    }
}

/// `DOCKER_DAEMON_ARGS` is word-split the way an unquoted shell expansion is.
pub fn split_daemon_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> BootstrapConfig {
        let mut argv = vec!["dind-init"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).run.into()
    }

    #[test]
    fn test_split_daemon_args() {
        assert_eq!(
            split_daemon_args("  --debug   --mtu=1400\t--insecure-registry reg:5000 "),
            vec!["--debug", "--mtu=1400", "--insecure-registry", "reg:5000"]
        );
        assert!(split_daemon_args("").is_empty());
    }

    #[test]
    fn test_flags_resolve_into_config() {
        let cfg = parse(&[
            "--log", "file",
            "--var-lib-docker-size", "12",
            "--network-offset", "0.0.2.0",
            "--network-size", "20",
            "--daemon-args", "--debug --mtu=1400",
            "--", "make", "test",
        ]);
        assert_eq!(cfg.loopback_size_gb, 12);
        assert_eq!(
            cfg.network,
            Some(NetworkConfig {
                offset: Ipv4Addr::new(0, 0, 2, 0),
                size: 20,
                bridge: "docker0".into(),
            })
        );
        assert_eq!(cfg.daemon.extra_args, vec!["--debug", "--mtu=1400"]);
        assert_eq!(cfg.daemon.log, LogMode::File);
        assert_eq!(cfg.command, vec!["make", "test"]);
    }

    #[test]
    fn test_rejects_out_of_range_size() {
        let res = Harness::try_parse_from(["dind-init", "--network-size", "33"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_rejects_malformed_offset() {
        let res = Harness::try_parse_from(["dind-init", "--network-offset", "0.0.1"]);
        assert!(res.is_err());
    }
}
