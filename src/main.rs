mod collectors;
mod config;
mod report;

use clap::Parser;
use collectors::system::SysinfoHost;
use config::Config;
use report::{collect_report, ReportOptions};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Print a one-line JSON snapshot of host CPU, memory and disk usage.
#[derive(Parser, Debug)]
#[command(name = "node-usage")]
#[command(version, about)]
struct Cli {
    /// Command whose output is reported as service_status, e.g. "service nginx status".
    /// Split on whitespace; arguments cannot contain spaces.
    #[arg(long = "check_service_command", value_name = "COMMAND")]
    check_service_command: Option<String>,
    /// Log file to tail into tail_log_file.
    #[arg(long = "log_file", value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Number of trailing log lines.
    #[arg(long = "tail_log_num", value_name = "N", default_value_t = 20)]
    tail_log_num: usize,
    /// Optional YAML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the example YAML config with its defaults and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let options = ReportOptions {
        service_command: cli.check_service_command,
        log_file: cli.log_file,
        tail_lines: cli.tail_log_num,
    };

    let host = SysinfoHost::new();
    let report = match collect_report(&host, &options, &cfg).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "failed to collect usage report");
            std::process::exit(1);
        }
    };

    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(err) => {
            error!(error = %err, "failed to encode usage report");
            std::process::exit(1);
        }
    }
}

// stdout carries only the report.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
