use std::fmt;
use std::io::{self, Write};

use serde::Serialize;
use sync_store::{DeadLetterRecord, QueuedRequest};
use sync_worker::clock::format_timestamp;
use sync_worker::{DrainReport, SyncStatus};

/// Output format selection for all subcommands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Single JSON object on stdout.
    Json,
    /// Human-readable summary on stdout.
    #[default]
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Subcommand result printed on success.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Report {
    Status(SyncStatus),
    Pending(Vec<QueuedRequest>),
    DeadLetters(Vec<DeadLetterRecord>),
    Drained(DrainReport),
    Stopped { served: usize },
}

impl Report {
    fn write_human(&self, out: &mut impl Write) -> io::Result<()> {
        match self {
            Self::Status(status) => {
                writeln!(out, "pending: {}", status.pending)?;
                writeln!(out, "failed:  {}", status.failed)
            }
            Self::Pending(records) => {
                if records.is_empty() {
                    return writeln!(out, "queue is empty");
                }
                for record in records {
                    writeln!(
                        out,
                        "#{:<5} {:<6} {}  retries={} queued={}{}",
                        record.id.unwrap_or_default(),
                        record.method,
                        record.url,
                        record.retries,
                        format_timestamp(record.timestamp),
                        record
                            .last_error
                            .as_deref()
                            .map(|e| format!("  last error: {e}"))
                            .unwrap_or_default(),
                    )?;
                }
                Ok(())
            }
            Self::DeadLetters(records) => {
                if records.is_empty() {
                    return writeln!(out, "no dead letters");
                }
                for record in records {
                    writeln!(
                        out,
                        "#{:<5} {:<6} {}  reason={} retries={} moved={}",
                        record.request.id.unwrap_or_default(),
                        record.request.method,
                        record.request.url,
                        record.reason,
                        record.request.retries,
                        format_timestamp(record.moved_at),
                    )?;
                }
                Ok(())
            }
            Self::Drained(report) => {
                writeln!(
                    out,
                    "examined {}, replayed {}: {} delivered, {} retrying, {} dead-lettered",
                    report.examined,
                    report.replayed,
                    report.succeeded,
                    report.retried,
                    report.dead_lettered.len(),
                )?;
                if report.skipped_backoff > 0 {
                    writeln!(out, "{} waiting out their backoff", report.skipped_backoff)?;
                }
                if report.store_errors > 0 {
                    writeln!(out, "{} store error(s), see log", report.store_errors)?;
                }
                Ok(())
            }
            Self::Stopped { served } => writeln!(out, "served {served} request(s)"),
        }
    }
}

/// Write a successful result to stdout.
pub fn emit(format: OutputFormat, report: &Report) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    render(format, report, &mut out)
}

fn render(format: OutputFormat, report: &Report, out: &mut impl Write) -> io::Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, report).map_err(io::Error::other)?;
            writeln!(out)
        }
        OutputFormat::Human => report.write_human(out),
    }
}

/// Write an error to stdout (JSON mode) or stderr (human mode).
pub fn emit_error(format: OutputFormat, exit_code: u8, message: &str) {
    match format {
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": message,
                "exit_code": exit_code,
            });
            // JSON errors go to stdout so the caller always gets valid JSON on stdout.
            println!("{obj}");
        }
        OutputFormat::Human => {
            eprintln!("error: {message}");
        }
    }
}
