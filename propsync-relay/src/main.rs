//! Standalone propsync relay.
//!
//! Hosts a bus without any editor instance attached. Instances elsewhere
//! connect with `launch_relay` off and the address this binary logs on start.

mod config;

use std::fs::File;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use propsync_net::{local_ip, Relay};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

fn init_logging(verbose: bool) {
    use simplelog::{
        ColorChoice, CombinedLogger, LevelFilter, SharedLogger, TermLogger, TerminalMode,
        WriteLogger,
    };

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let dir = config::config_dir();
    let _ = std::fs::create_dir_all(&dir);
    let log_path = dir.join("relay.log");

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    match File::create(&log_path) {
        Ok(file) => loggers.push(WriteLogger::new(log_level, simplelog::Config::default(), file)),
        Err(e) => eprintln!("cannot create log file {}: {}", log_path.display(), e),
    }

    if CombinedLogger::init(loggers).is_err() {
        eprintln!("logger already initialized");
    }

    info!("propsync-relay starting (log level: {:?})", log_level);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut config = config::Config::load();
    config.apply_args(&args);

    init_logging(config.verbose());
    for warning in config.take_warnings() {
        warn!(target: "config", "{}", warning);
    }

    let (recv_port, send_port) = (config.recv_port(), config.send_port());
    let relay = match Relay::launch_on(config.bind_ip(), recv_port, send_port) {
        Ok(relay) => relay,
        Err(e) => {
            error!(target: "propsync::relay", "{}", e);
            std::process::exit(1);
        }
    };

    match local_ip() {
        Some(ip) => info!(
            target: "propsync::relay",
            "instances connect to {} (publish {}, subscribe {})", ip, recv_port, send_port
        ),
        None => warn!(target: "propsync::relay", "no LAN address found; only local instances can connect"),
    }

    let mut last_counts = (0, 0);
    while relay.is_running() {
        thread::sleep(STATUS_INTERVAL);
        let counts = (relay.publisher_count(), relay.subscriber_count());
        if counts != last_counts {
            info!(
                target: "propsync::relay",
                "{} publisher(s), {} subscriber(s)", counts.0, counts.1
            );
            last_counts = counts;
        }
    }

    error!(target: "propsync::relay", "relay loop exited");
    std::process::exit(1);
}
