use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bandmon",
    version,
    about = "Per-process network bandwidth monitor for Linux"
)]
pub struct Cli {
    /// Sampling interval in seconds [default: 1.0]
    #[arg(long, default_value_t = 1.0, value_parser = validate_interval)]
    pub interval: f64,

    /// Path to the SQLite database file
    #[arg(long, default_value = "bandwidth.db")]
    pub db: PathBuf,

    /// Number of processes shown in the live table
    #[arg(long, default_value_t = 20, value_parser = validate_top)]
    pub top: usize,

    /// Delete records older than this many days (sweep runs hourly)
    #[arg(long, value_parser = validate_retention_days)]
    pub retention_days: Option<u32>,

    /// Path to the compiled probe object
    #[arg(long, default_value = "target/bpfel-unknown-none/release/bandmon-ebpf")]
    pub bpf_object: PathBuf,

    /// Suppress the live console table (records are still persisted)
    #[arg(long)]
    pub quiet: bool,
}

fn validate_interval(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if val < 0.1 {
        Err("interval must be at least 0.1 seconds".to_string())
    } else if val > 10.0 {
        Err("interval must be at most 10.0 seconds".to_string())
    } else {
        Ok(val)
    }
}

fn validate_top(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val < 1 {
        Err("top must be at least 1".to_string())
    } else if val > 500 {
        Err("top must be at most 500".to_string())
    } else {
        Ok(val)
    }
}

fn validate_retention_days(s: &str) -> Result<u32, String> {
    let val: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val < 1 {
        Err("retention-days must be at least 1".to_string())
    } else if val > 3650 {
        Err("retention-days must be at most 3650".to_string())
    } else {
        Ok(val)
    }
}
