use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "wind-telemetry",
    version,
    about = "Anemometer ingest, wind history aggregation and alert notifications"
)]
pub struct Args {
    /// Overrides WIND_HTTP_BIND.
    #[arg(long)]
    pub http_bind: Option<String>,
    /// Overrides WIND_UDP_PORT.
    #[arg(long)]
    pub udp_port: Option<u16>,
    /// Run one aggregation and retention pass, then exit.
    #[arg(long, default_value_t = false)]
    pub run_aggregation_once: bool,
    /// Run one token/snooze cleanup pass, then exit.
    #[arg(long, default_value_t = false)]
    pub run_cleanup_once: bool,
}

impl Args {
    pub fn one_shot(&self) -> bool {
        self.run_aggregation_once || self.run_cleanup_once
    }
}
