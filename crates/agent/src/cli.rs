use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "nanogrid-agent", about = "NanoGrid compute agent", disable_version_flag = true)]
pub struct Cli {
    /// Path to a YAML config file. Overrides `$NANOGRID_CONFIG` and `./config.yaml`.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: (),
}
