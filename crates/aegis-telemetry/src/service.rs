//! Audit service with a dedicated background writer
//!
//! Producers enqueue entries without blocking; a single flusher task owns the
//! file writer, so write ordering follows submission order and the append-only
//! discipline is enforced in one place.

use crate::entry::AuditEntry;
use crate::store::{AuditQuery, AuditReader, AuditStats, AuditStoreConfig, AuditWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval at which the writer flushes regardless of volume
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum Command {
    Record(Box<AuditEntry>),
    Flush,
}

/// Handle for recording and querying audit entries
pub struct AuditService {
    sender: mpsc::UnboundedSender<Command>,
    reader: Arc<AuditReader>,
}

impl AuditService {
    /// Start the service and its background writer task
    pub fn new(config: AuditStoreConfig) -> std::io::Result<Self> {
        let writer = AuditWriter::new(config.clone())?;
        let reader = Arc::new(AuditReader::new(config.clone()));
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(writer, receiver));
        info!(dir = %config.dir.display(), "audit service started");

        Ok(Self { sender, reader })
    }

    /// Enqueue an entry; never blocks the caller
    pub fn record(&self, entry: AuditEntry) {
        if self.sender.send(Command::Record(Box::new(entry))).is_err() {
            warn!("audit writer is gone; entry dropped");
        }
    }

    /// Enqueue an entry, reporting a dead writer to the caller.
    ///
    /// Critical audit obligations use this form: a request must not succeed
    /// when its audit record cannot be accepted.
    pub fn try_record(&self, entry: AuditEntry) -> aegis_core::Result<()> {
        self.sender
            .send(Command::Record(Box::new(entry)))
            .map_err(|_| aegis_core::Error::Obligation("audit writer unavailable".to_string()))
    }

    /// Ask the writer to flush buffered entries
    pub fn flush(&self) {
        let _ = self.sender.send(Command::Flush);
    }

    /// Query persisted entries
    pub fn query(&self, query: &AuditQuery) -> std::io::Result<Vec<AuditEntry>> {
        self.reader.query(query)
    }

    /// The most recent `n` entries, newest first
    pub fn latest(&self, n: usize) -> std::io::Result<Vec<AuditEntry>> {
        self.reader.latest(n)
    }

    /// Summary statistics for a query
    pub fn stats(&self, query: &AuditQuery) -> std::io::Result<AuditStats> {
        self.reader.stats(query)
    }
}

async fn run_writer(mut writer: AuditWriter, mut receiver: mpsc::UnboundedReceiver<Command>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Record(entry)) => {
                    if let Err(e) = writer.write_entry(&entry) {
                        error!("failed to write audit entry: {}", e);
                    }
                }
                Some(Command::Flush) => {
                    if let Err(e) = writer.flush() {
                        error!("failed to flush audit log: {}", e);
                    }
                }
                None => {
                    debug!("audit writer shutting down");
                    let _ = writer.flush();
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = writer.flush() {
                    error!("periodic audit flush failed: {}", e);
                }
            }
        }
    }
}
