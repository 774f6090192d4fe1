use crate::model::{AttachMode, BoxProvider, ResourceSize};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "hck",
    version,
    about = "Provision and attach to hacking boxes on Docker, Kubernetes or the cloud."
)]
pub struct CliArgs {
    /// tracing filter (for example: warn,hck=debug)
    #[arg(long, global = true, default_value = "warn")]
    pub log_filter: String,

    /// Path of the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Manage boxes
    #[command(subcommand)]
    Box(BoxCommand),
}

#[derive(Debug, Clone, Subcommand)]
pub enum BoxCommand {
    /// Create a box and print its name
    Create {
        /// Template name or path
        template: String,
        #[command(flatten)]
        target: ProviderArg,
        #[arg(long)]
        size: Option<ResourceSize>,
    },
    /// Create a box, attach to it and delete it on exit
    Open {
        template: String,
        #[command(flatten)]
        target: ProviderArg,
        #[arg(long)]
        size: Option<ResourceSize>,
        #[command(flatten)]
        attach: AttachArgs,
    },
    /// Attach to an existing box
    Connect {
        name: String,
        #[command(flatten)]
        target: ProviderArg,
        #[command(flatten)]
        attach: AttachArgs,
    },
    /// Print the details of a box
    Describe {
        name: String,
        #[command(flatten)]
        target: ProviderArg,
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },
    /// List boxes of one or every provider
    List {
        #[command(flatten)]
        target: ProviderArg,
    },
    /// Delete boxes by name, or all of them
    Delete {
        #[arg(required_unless_present = "all")]
        names: Vec<String>,
        #[arg(long, conflicts_with = "names")]
        all: bool,
        #[command(flatten)]
        target: ProviderArg,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ProviderArg {
    /// docker, kube or cloud
    #[arg(short, long)]
    pub provider: Option<BoxProvider>,
}

#[derive(Debug, Clone, Copy, Args)]
pub struct AttachArgs {
    /// Open tunnels without a shell
    #[arg(long, conflicts_with = "no_tunnel")]
    pub tunnel_only: bool,

    /// Open a shell without tunnels
    #[arg(long)]
    pub no_tunnel: bool,
}

impl AttachArgs {
    pub fn mode(self) -> AttachMode {
        match (self.tunnel_only, self.no_tunnel) {
            (true, _) => AttachMode::TunnelOnly,
            (false, true) => AttachMode::ShellOnly,
            (false, false) => AttachMode::ShellAndTunnel,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}
