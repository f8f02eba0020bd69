//! Progress reporting for export, import and backup jobs.
//!
//! Jobs publish [`ProgressEvent`]s on an unbounded `tokio` channel. Callers
//! either consume the events themselves or hand the receiving end to a
//! [`ProgressRenderer`], which draws one `indicatif` bar per database.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;

/// A progress update from a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A database job started (backup or restore)
    DatabaseStarted {
        database: String,
        index: usize,
        total: usize,
    },

    /// Export finished writing a table
    TableExported {
        database: String,
        table: String,
        /// 1-based ordinal of the table
        index: usize,
        total: usize,
        rows: u64,
    },

    /// Import advanced through its source
    ImportProgress {
        database: String,
        bytes_read: u64,
        /// `None` when the source is compressed and its size is unknown
        total_bytes: Option<u64>,
        statements: u64,
    },

    /// Restore progress translated to a percentage (`None` when unknown)
    DatabasePercent {
        database: String,
        percent: Option<u8>,
        statements: u64,
    },

    /// A database job completed successfully
    DatabaseFinished { database: String },
}

impl ProgressEvent {
    pub fn database(&self) -> &str {
        match self {
            ProgressEvent::DatabaseStarted { database, .. }
            | ProgressEvent::TableExported { database, .. }
            | ProgressEvent::ImportProgress { database, .. }
            | ProgressEvent::DatabasePercent { database, .. }
            | ProgressEvent::DatabaseFinished { database } => database,
        }
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Creates a progress channel.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Sends an event if anyone is listening. A closed receiver is not an error.
pub(crate) fn emit(sender: Option<&ProgressSender>, event: ProgressEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}

/// Percentage of `done` out of `total`, clamped to 100.
pub fn percent(done: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(0) => Some(100),
        Some(t) => Some(((done.min(t) as u128 * 100) / t as u128) as u8),
        None => None,
    }
}

/// Draws progress events as terminal bars.
pub struct ProgressRenderer {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl ProgressRenderer {
    /// Renders to stderr.
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Renders nowhere; events are still tracked.
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, database: &str) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(database.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(bar_style());
            bar.set_message(database.to_string());
            bar
        })
    }

    /// Applies one event.
    pub fn handle(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::DatabaseStarted {
                database,
                index,
                total,
            } => {
                let bar = self.bar(database);
                bar.set_message(format!("[{}/{}] {}", index, total, database));
            }
            ProgressEvent::TableExported {
                database,
                table,
                index,
                total,
                rows,
            } => {
                let bar = self.bar(database);
                bar.set_length(*total as u64);
                bar.set_position(*index as u64);
                bar.set_message(format!("{}.{} ({} rows)", database, table, rows));
            }
            ProgressEvent::ImportProgress {
                database,
                bytes_read,
                total_bytes,
                statements,
            } => {
                let bar = self.bar(database);
                match total_bytes {
                    Some(total) => {
                        bar.set_length(*total);
                        bar.set_position(*bytes_read);
                    }
                    None => bar.set_position(0),
                }
                bar.set_message(format!("{} ({} statements)", database, statements));
            }
            ProgressEvent::DatabasePercent {
                database,
                percent,
                statements,
            } => {
                let bar = self.bar(database);
                bar.set_length(100);
                if let Some(p) = percent {
                    bar.set_position(u64::from(*p));
                }
                bar.set_message(format!("{} ({} statements)", database, statements));
            }
            ProgressEvent::DatabaseFinished { database } => {
                let bar = self.bar(database);
                if let Some(len) = bar.length() {
                    bar.set_position(len);
                }
                bar.finish_with_message(format!("{} done", database));
            }
        }
    }

    /// Consumes events until every sender is dropped.
    pub async fn run(mut self, mut events: ProgressReceiver) {
        while let Some(event) = events.recv().await {
            self.handle(&event);
        }
        self.finish_all();
    }

    /// Position of a database's bar, if one exists
    pub fn position(&self, database: &str) -> Option<u64> {
        self.bars.get(database).map(|b| b.position())
    }

    /// Finishes all progress bars.
    pub fn finish_all(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        }
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {percent}%")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
