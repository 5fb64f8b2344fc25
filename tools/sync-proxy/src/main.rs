pub mod cli;
pub mod config;
pub mod error;
pub mod output;
pub mod server;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::info;
use sync_store::{QueueIndex, QueueStore, StoreError};
use sync_worker::events::BACKGROUND_SYNC_TAG;
use sync_worker::{
    CacheStorage, DrainReport, EventOutcome, SyncPoller, SyncStatus, SyncWorker, SystemClock,
    UreqTransport, WorkerEvent,
};

use crate::cli::{Cli, Command, DrainArgs, PendingArgs, ServeArgs};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::output::Report;
use crate::server::Proxy;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) => {
            if let Err(e) = output::emit(cli.output, &report) {
                eprintln!("error: could not write output: {e}");
                return ExitCode::from(2);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            output::emit_error(cli.output, e.exit_status(), &e.to_string());
            e.exit_code()
        }
    }
}

fn run(cli: &Cli) -> Result<Report, ProxyError> {
    let config = ProxyConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Serve(args) => serve(config, args),
        Command::Status => {
            let store = open_store(&config.proxy.store)?;
            Ok(Report::Status(SyncStatus {
                pending: store.count()?,
                failed: store.count_dead_letters()?,
            }))
        }
        Command::Pending(PendingArgs { by_retries }) => {
            let store = open_store(&config.proxy.store)?;
            let index = if *by_retries {
                QueueIndex::Retries
            } else {
                QueueIndex::Timestamp
            };
            Ok(Report::Pending(store.pending_by(index)?))
        }
        Command::DeadLetters => {
            let store = open_store(&config.proxy.store)?;
            Ok(Report::DeadLetters(store.dead_letters()?))
        }
        Command::Drain(args) => drain(config, args),
    }
}

/// Open the ledger, or explain that `serve` already owns it.
fn open_store(path: &Path) -> Result<QueueStore, ProxyError> {
    QueueStore::open_file(path).map_err(|e| match e {
        StoreError::Locked { path } => ProxyError::LedgerBusy { path },
        other => ProxyError::Store(other),
    })
}

fn build_worker(config: &ProxyConfig) -> Result<SyncWorker, ProxyError> {
    let store = Arc::new(open_store(&config.proxy.store)?);
    let transport = Arc::new(UreqTransport::new(config.worker.request_timeout()));
    Ok(SyncWorker::new(
        config.worker.clone(),
        store,
        Arc::new(CacheStorage::new()),
        transport,
        Arc::new(SystemClock),
    )?)
}

fn serve(mut config: ProxyConfig, args: &ServeArgs) -> Result<Report, ProxyError> {
    if let Some(listen) = &args.listen {
        config.proxy.listen = listen.clone();
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(ProxyError::InvalidConfig(String::from("--workers must be positive")));
        }
        config.proxy.workers = workers;
    }
    let addr = config.listen_addr()?;

    let worker = Arc::new(build_worker(&config)?);
    worker.dispatch(WorkerEvent::Install)?;
    let poller = SyncPoller::spawn(Arc::clone(&worker), config.worker.poll_interval())?;

    let server = tiny_http::Server::http(addr).map_err(|e| ProxyError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    info!(
        "proxying {} on http://{} (queue: {})",
        worker.origin(),
        addr,
        config.proxy.store.display()
    );

    let proxy = Arc::new(Proxy::new(worker, Some(poller)));
    let served = server::serve(proxy, &server, config.proxy.workers, args.max_requests);
    Ok(Report::Stopped { served })
}

fn drain(config: ProxyConfig, args: &DrainArgs) -> Result<Report, ProxyError> {
    let worker = build_worker(&config)?;
    let event = WorkerEvent::Sync {
        tag: String::from(BACKGROUND_SYNC_TAG),
    };
    let EventOutcome::Drained(report) = worker.dispatch(event)? else {
        return Ok(Report::Drained(DrainReport::default()));
    };
    if args.strict && !report.dead_lettered.is_empty() {
        return Err(ProxyError::DeadLettered {
            dead: report.dead_lettered.len(),
        });
    }
    Ok(Report::Drained(report))
}
