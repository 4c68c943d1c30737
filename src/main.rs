//! blocking-cache: a thread-per-connection cache server
//!
//! Speaks the memcached text protocol over blocking sockets. Every accepted
//! connection is served by its own OS thread, up to a configured ceiling.
//!
//! Features:
//! - get, set, add, replace, append, prepend, delete, incr, decr, flush_all
//! - Automatic key expiration
//! - Memory usage capping with LRU eviction
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod executor;
mod protocol;
mod runtime;
mod signals;
mod storage;

use config::Config;
use runtime::Server;
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TERMINATE: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        max_memory_mb = config.max_memory / 1024 / 1024,
        "Starting blocking-cache server"
    );

    // Blocked here so every thread spawned later inherits the mask and only
    // `sigwait` below sees termination requests.
    signals::block(&TERMINATE)?;

    let storage = Storage::new(config.max_memory);
    let mut server = Server::new(storage, config.limits);
    server.start(config.listen, config.workers)?;

    let signal = signals::wait(&TERMINATE)?;
    info!(signal, "Received termination signal");

    server.stop();
    server.join();
    Ok(())
}
