mod ui;

use clap::Parser;
use crate::ui::cli;
use log::LevelFilter;
use sftp_core::utils::logging::init_logging;

#[tokio::main]
async fn main() {
    init_logging(LevelFilter::Warn);
    let args = cli::Args::parse();
    if let Err(e) = cli::run_cli(args).await {
        eprintln!("sftp-rs: {e}");
        std::process::exit(1);
    }
}
