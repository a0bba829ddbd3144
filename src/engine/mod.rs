mod conflict;
mod error;
mod ledger;
mod mutations;
mod payments;
mod queries;
mod unit;

pub use conflict::{is_available, validate_slot};
use conflict::check_no_conflict;
pub use error::{EngineError, ErrorKind};
pub use ledger::{CancelOutcome, ReservationLedger, SharedSchedule};
pub use payments::{PaymentLedger, RandomReferences, ReferenceGenerator};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::model::*;
use crate::wal::{Wal, WalMark};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Mark {
        response: oneshot::Sender<io::Result<WalMark>>,
    },
    SwapCompacted {
        since: WalMark,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// issues a single fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Keep ordering: flush what we have before marking or swapping.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Append and fsync the batch. On failure every waiter rolls back, so the
/// log is cut back to where the batch began.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rewind(mark)
    {
        tracing::error!("WAL rewind failed, refusing further appends: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Mark { response } => {
            let _ = response.send(wal.mark());
        }
        WalCommand::SwapCompacted { since, response } => {
            let _ = response.send(wal.swap_compact_file(since));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking orchestrator. Owns the catalog and both ledgers, and is the
/// only place that sequences them into atomic operations.
pub struct Engine {
    catalog: Catalog,
    ledger: ReservationLedger,
    payments: PaymentLedger,
    wal_tx: mpsc::Sender<WalCommand>,
    wal_path: PathBuf,
    /// Mutations hold this shared; compaction holds it exclusively while it
    /// snapshots state and marks the matching end of the log.
    compaction_gate: RwLock<()>,
    /// One compaction at a time; they share the temp file.
    compaction: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_references(wal_path, Box::new(RandomReferences))
    }

    /// Recover state from the WAL at `wal_path`, seeding the starter catalog
    /// if the log has never recorded one. Must run inside a tokio runtime.
    pub fn with_references(
        wal_path: PathBuf,
        references: Box<dyn ReferenceGenerator>,
    ) -> io::Result<Self> {
        let (mut wal, events) = Wal::recover(&wal_path)?;

        let mut courts = Vec::new();
        let mut schedules: HashMap<ScheduleKey, DaySchedule> = HashMap::new();
        let payments = PaymentLedger::new(references);
        let mut last_booking_id = 0;

        for event in events {
            match event {
                Event::CourtAdded { court } => courts.push(court),
                Event::BookingCommitted { booking, payment } => {
                    last_booking_id = last_booking_id.max(booking.id);
                    let key = booking.schedule_key();
                    let schedule = schedules
                        .entry(key)
                        .or_insert_with(|| DaySchedule::new(key.0, key.1));
                    if booking.state.is_active()
                        && let Err(e) = check_no_conflict(schedule, &booking.slot)
                    {
                        warn!(booking_id = booking.id, "replay: skipping booking, {e}");
                        payments.retire_replayed(&payment);
                        continue;
                    }
                    schedule.insert_booking(booking);
                    payments.insert_replayed(payment);
                }
                Event::BookingCancelled { booking_id, court_id, date } => {
                    let Some(booking) = schedules
                        .get_mut(&(court_id, date))
                        .and_then(|s| s.get_mut(booking_id))
                    else {
                        warn!(booking_id, "replay: cancellation for unknown booking");
                        continue;
                    };
                    booking.state = BookingState::Cancelled;
                    payments.restore(booking_id, PaymentState::Refunded);
                }
            }
        }

        let catalog = if courts.is_empty() {
            let starter = Catalog::starter();
            for court in starter.iter() {
                wal.append_buffered(&Event::CourtAdded { court: court.clone() })?;
            }
            wal.flush_sync()?;
            info!("seeded {} courts into {}", starter.len(), wal_path.display());
            starter
        } else {
            Catalog::from_courts(courts)
        };

        let ledger = ReservationLedger::from_replay(schedules, last_booking_id);
        info!(
            "recovered {} courts, {} payments from {}",
            catalog.len(),
            payments.len(),
            wal_path.display()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            catalog,
            ledger,
            payments,
            wal_tx,
            wal_path,
            compaction_gate: RwLock::new(()),
            compaction: Mutex::new(()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    pub fn payments(&self) -> &PaymentLedger {
        &self.payments
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_request(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await
    }

    /// Rewrite the WAL as the catalog plus one record per booking. Only the
    /// snapshot runs under the gate; the new file is written while bookings
    /// continue, and whatever they appended meanwhile is carried over at the
    /// swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _compaction = self.compaction.lock().await;

        let (events, since) = {
            let _gate = self.compaction_gate.write().await;
            let events = self.snapshot_events().await;
            let since = self
                .wal_request(|response| WalCommand::Mark { response })
                .await?;
            (events, since)
        };

        let path = self.wal_path.clone();
        tokio::task::spawn_blocking(move || Wal::write_compact_file(&path, &events))
            .await
            .map_err(|e| EngineError::WalError(format!("compaction task failed: {e}")))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        self.wal_request(|response| WalCommand::SwapCompacted { since, response })
            .await
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .catalog
            .iter()
            .map(|court| Event::CourtAdded { court: court.clone() })
            .collect();

        let mut committed = Vec::new();
        for schedule in self.ledger.schedules() {
            let guard = schedule.read().await;
            for booking in &guard.bookings {
                match self.payments.get(booking.id) {
                    Some(payment) => committed.push((booking.clone(), payment)),
                    None => warn!(booking_id = booking.id, "compaction: booking without payment"),
                }
            }
        }
        committed.sort_by_key(|(booking, _)| booking.id);
        events.extend(
            committed
                .into_iter()
                .map(|(booking, payment)| Event::BookingCommitted { booking, payment }),
        );
        events
    }

    /// Send a command to the WAL writer and wait for its fallible reply.
    async fn wal_request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<io::Result<T>>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(command(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
