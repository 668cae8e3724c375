use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use bandmon::cli::Cli;
use bandmon::error::BandmonError;
use bandmon::privilege;
use bandmon::probe;
use bandmon::sampler::{self, SamplerConfig};
use bandmon::storage::BandwidthStore;

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &BandmonError) -> i32 {
    match err {
        BandmonError::NotRoot => 1,
        BandmonError::Attach(_) | BandmonError::CounterTable(_) => 2,
        BandmonError::StorageOpen(_) | BandmonError::Persistence(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

#[cfg(feature = "ebpf")]
fn run(cli: Cli) -> Result<(), BandmonError> {
    install_signal_handlers();

    privilege::check_root()?;

    if !probe::probes_available() {
        return Err(BandmonError::Attach(
            "kernel does not support the probes (need >= 5.8 with BTF)".to_string(),
        ));
    }

    let store = BandwidthStore::open(&cli.db)?;
    log::info!("storage open at {}", cli.db.display());

    // Keep the probe set alive for the whole run; dropping it detaches.
    let (_probes, mut table) = probe::load(&cli.bpf_object)?;

    let cfg = SamplerConfig {
        interval: Duration::from_secs_f64(cli.interval),
        top: cli.top,
        quiet: cli.quiet,
        retention_days: cli.retention_days,
    };
    log::info!(
        "sampling every {:.1}s, retention: {}",
        cli.interval,
        match cli.retention_days {
            Some(d) => format!("{d} days"),
            None => "disabled".to_string(),
        }
    );

    sampler::run(&mut table, &store, &cfg, &SHUTDOWN_REQUESTED)?;
    log::info!("shutdown complete");
    Ok(())
}

#[cfg(not(feature = "ebpf"))]
fn run(_cli: Cli) -> Result<(), BandmonError> {
    Err(BandmonError::Fatal(
        "built without the ebpf feature; monitoring is unavailable".to_string(),
    ))
}
