use clap::Parser;
use sentinel_backup::backup::backup_config::BackupConfig;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, Level};

/// Scheduled backups of databases and directories to object storage
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    /// Run one backup immediately and exit, ignoring the schedule
    #[arg(long)]
    run_now: bool,
}

fn main() {
    let args = Args::parse();

    let config = match BackupConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("{e}");
            exit(2);
        }
    };

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let res = if args.run_now || config.schedule.is_none() {
        config.run_once()
    } else {
        config.start_loop()
    };

    match res {
        Ok(_) => info!("Backup finished"),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
