use clap::Parser;
use std::path::PathBuf;

use display_coordinator::config;

#[derive(Parser, Debug)]
#[command(name = "display-coordinator")]
#[command(version)]
#[command(about = "Display controller coordinator running against a headless engine", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/display-coordinator.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Virtual console policy (inactive, fallback, forced)
    #[arg(long)]
    pub virtcon_mode: Option<String>,

    /// Do not start the built-in virtual console client
    #[arg(long, action)]
    pub no_virtcon: bool,

    /// Exit after this many vsyncs reach the virtual console (0 runs until Ctrl-C)
    #[arg(long)]
    pub frames: Option<u64>,

    /// Advertise capture support on the headless engine
    #[arg(long, action)]
    pub capture: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
