//! The stack daemon.
//!
//! Loads the configuration, opens the capture/inject FIFOs and the control
//! channel, creates the named semaphore pair and runs the stack until a
//! fatal alert or an external shutdown request. Exit code 0 on clean
//! shutdown, 1 with a diagnostic for unrecoverable initialization
//! failures.

extern crate env_logger;
extern crate netfabric;

#[macro_use]
extern crate log;

use netfabric::config::Config;
use netfabric::socket::ControlChannel;
use netfabric::stack::{LinkStreams, NetworkStack, StackResult};

use std::env;
use std::path::Path;
use std::process;

fn main() {
    env_logger::init();
    match run() {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("netfabricd: {}", e);
            process::exit(1);
        }
    }
}

#[cfg(unix)]
fn run() -> StackResult<()> {
    use netfabric::sem::NamedGate;
    use std::fs::{File, OpenOptions};
    use std::sync::atomic::Ordering;
    use std::thread;

    let config_path = env::args().nth(1).unwrap_or_else(|| "netfabric.cfg".to_owned());
    let config = Config::load(Path::new(&config_path))?;

    info!("opening capture stream {}", config.capture_pipe);
    let capture = File::open(&config.capture_pipe)?;
    info!("opening inject stream {}", config.inject_pipe);
    let inject = OpenOptions::new().write(true).open(&config.inject_pipe)?;
    info!("opening control channel {} / {}",
          config.channel_pipe,
          config.reply_pipe);
    let channel_rx = File::open(&config.channel_pipe)?;
    let channel_tx = OpenOptions::new().write(true).open(&config.reply_pipe)?;
    let gate = NamedGate::open()?;
    let gate_flag = gate.close_flag();

    let link = LinkStreams {
        capture: Box::new(capture),
        inject: Box::new(inject),
    };
    let channel = ControlChannel::new(Box::new(channel_rx), Box::new(channel_tx));
    let stack = NetworkStack::new(&config, link, channel, Box::new(gate))?;

    // Release a socket server parked on the call semaphore once the stack
    // begins shutting down, so the final join can complete.
    let shutdown = stack.shutdown_signal();
    let watcher = thread::spawn(move || {
        shutdown.wait();
        gate_flag.store(true, Ordering::SeqCst);
    });

    stack.run();
    watcher.join().ok();
    info!("clean shutdown");
    Ok(())
}

#[cfg(not(unix))]
fn run() -> StackResult<()> {
    use std::io;
    Err(netfabric::stack::StackError::Io(io::Error::new(io::ErrorKind::Other,
                                                        "netfabricd needs unix named semaphores")))
}
