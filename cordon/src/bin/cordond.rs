use std::{env, sync::mpsc::channel};

use log::{debug, info};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use cordon::{EnforcementManager, Settings};

fn main() -> anyhow::Result<()> {
    let log_level = match env::var("CORDON_DEBUG") {
        Ok(_) => LevelFilter::Debug,
        Err(_) => LevelFilter::Info,
    };
    TermLogger::init(
        LevelFilter::Debug,
        ConfigBuilder::new()
            .set_target_level(log_level)
            .set_location_level(log_level)
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let settings = Settings::new()?;
    let manager = EnforcementManager::new(settings);
    manager.initialize()?;
    if manager.is_available() {
        info!("LSM enforcement is live");
    } else {
        info!("BPF LSM unavailable; containers will run unconfined");
    }

    let (interrupt_tx, interrupt_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })?;
    interrupt_rx.recv()?;

    debug!("interrupted, shutting down");
    manager.shutdown();

    Ok(())
}
