use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "probixel")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Host-resident monitoring agent with tunnel-aware probes")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long = "config", default_value = "config.yaml")]
    pub config: std::path::PathBuf,

    /// Path to the PID file
    #[arg(long = "pidfile", default_value = "/tmp/probixel.pid")]
    pub pidfile: std::path::PathBuf,

    /// Check whether the process named in the pidfile is alive and exit
    #[arg(long = "health")]
    pub health: bool,

    /// Seconds to wait before the first checks; 0 disables
    #[arg(long = "delay", default_value_t = 10)]
    pub delay: u64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
