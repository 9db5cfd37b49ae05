//! coopd: a single-threaded cooperative numeric line server
//!
//! One OS thread multiplexes all client connections. Each connection is a
//! task: an explicit state machine that suspends whenever it would block
//! on socket readiness and resumes when the poller reports the socket
//! ready. Clients send decimal integers, one per line; the server answers
//! with the transformed value (`n + 42` by default).
//!
//! There is deliberately no per-connection failure isolation: the first
//! malformed request or socket fault from any client is fatal to the
//! whole process.

mod config;
mod protocol;
mod runtime;
mod server;

use config::Config;
use runtime::Scheduler;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server = Server::bind(&config.listen, protocol::add42, config.read_chunk)?;

    info!(
        addr = %server.local_addr(),
        read_chunk = config.read_chunk,
        "Starting coopd server"
    );

    let mut scheduler = Scheduler::new()?;
    scheduler.spawn(server.into_task());

    // Only returns on a fatal error: the accept task never completes.
    scheduler.run()?;
    Ok(())
}
