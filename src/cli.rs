//! Code related to CLI things
//!

use clap::*;

#[derive(Parser, Clone)]
pub struct SharedOpts {
    #[clap(short, long, help = "Configuration file")]
    pub config: Option<String>,
    #[clap(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the stub listener
    Server {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Validate the configuration and exit
    ConfigCheck {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Print the effective configuration as JSON
    ExportConfig {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
}

#[derive(Parser)]
#[clap(name = "stubns", about = "A local DNS stub listener", version)]
pub struct CliOpts {
    #[clap(subcommand)]
    pub command: Commands,
}
