use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};

use crate::protocol::ProtocolSettings;
use crate::supervisor::LaunchSpec;

#[derive(Parser, Debug)]
#[clap(name = "melotts-server", about = "HTTP front end for an interactive melotts process")]
pub struct Args {
    /// Working directory of the child; other default paths hang off it.
    #[clap(long, default_value = ".")]
    pub project_root: PathBuf,

    /// Defaults to <project-root>/install/melotts.
    #[clap(long)]
    pub executable: Option<PathBuf>,

    /// JSON object of child arguments. Defaults to <project-root>/arguments.json.
    #[clap(long)]
    pub arguments: Option<PathBuf>,

    #[clap(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[clap(long, default_value_t = 8802)]
    pub port: u16,

    #[clap(long, default_value_t = 120)]
    pub ready_timeout_secs: u64,

    /// Bound on each wait for a child prompt; 0 waits forever.
    #[clap(long, default_value_t = 60)]
    pub job_timeout_secs: u64,

    #[clap(long, default_value_t = 100)]
    pub settle_delay_ms: u64,

    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn resolved_project_root(&self) -> anyhow::Result<PathBuf> {
        std::path::absolute(&self.project_root)
            .with_context(|| format!("resolving {}", self.project_root.display()))
    }

    pub fn arguments_path(&self, project_root: &Path) -> PathBuf {
        self.arguments
            .clone()
            .unwrap_or_else(|| project_root.join("arguments.json"))
    }

    pub fn launch_spec(&self, project_root: &Path, args: Vec<String>) -> LaunchSpec {
        let executable = self
            .executable
            .clone()
            .unwrap_or_else(|| project_root.join("install").join("melotts"));
        LaunchSpec {
            executable,
            args,
            working_dir: project_root.to_path_buf(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            read_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
            ..ProtocolSettings::default()
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
