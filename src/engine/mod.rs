mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedIntent = Arc<Mutex<PaymentIntent>>;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How long a writer waits for a room or invoice lock.
    pub lock_timeout: Duration,
    /// Rewrite the log at open once it holds more records than this.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            compact_threshold: 1000,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event,
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// Embedded storage engine: bookings grouped per room behind a `RwLock`,
/// payment intents behind a per-invoice `Mutex`, made durable by the WAL.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_rooms: Arc<DashMap<BookingId, RoomId>>,
    pub(super) intents: Arc<DashMap<InvoiceId, SharedIntent>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) lock_timeout: Duration,
}

/// State rebuilt from the log before it is shared.
#[derive(Default)]
struct Replayed {
    rooms: HashMap<RoomId, RoomState>,
    intents: HashMap<InvoiceId, PaymentIntent>,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::BookingCreated { booking } | Event::BookingChanged { booking } => {
                let rs = self
                    .rooms
                    .entry(booking.room_id)
                    .or_insert_with(|| RoomState::new(booking.room_id));
                if let Some(slot) = rs.bookings.iter_mut().find(|b| b.id == booking.id) {
                    *slot = booking;
                } else {
                    rs.insert_booking(booking);
                }
            }
            Event::IntentCreated { intent } | Event::IntentChanged { intent } => {
                self.intents.insert(intent.inv_id, intent);
            }
        }
    }

    /// Minimal event list that recreates this state.
    fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .rooms
            .values()
            .flat_map(|rs| rs.bookings.iter())
            .map(|b| Event::BookingCreated { booking: b.clone() })
            .collect();
        let mut intents: Vec<&PaymentIntent> = self.intents.values().collect();
        intents.sort_by_key(|i| i.inv_id);
        events.extend(intents.into_iter().map(|i| Event::IntentCreated { intent: i.clone() }));
        events
    }
}

impl Engine {
    /// Replay the WAL at `wal_path`, compact it if it grew past the threshold,
    /// and start the background writer. Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let logged = events.len();
        let mut replayed = Replayed::default();
        for event in events {
            replayed.apply(event);
        }

        let mut wal = Wal::open(&wal_path)?;
        let snapshot = replayed.snapshot();
        if logged as u64 > config.compact_threshold && snapshot.len() < logged {
            wal.compact(&snapshot)?;
            tracing::info!(
                path = %wal_path.display(),
                before = logged,
                after = snapshot.len(),
                "compacted WAL on open"
            );
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_rooms = DashMap::new();
        let rooms = DashMap::new();
        for (room_id, rs) in replayed.rooms {
            for b in &rs.bookings {
                booking_rooms.insert(b.id, room_id);
            }
            rooms.insert(room_id, Arc::new(RwLock::new(rs)));
        }
        let intents: DashMap<_, _> = replayed
            .intents
            .into_iter()
            .map(|(id, intent)| (id, Arc::new(Mutex::new(intent))))
            .collect();

        Ok(Self {
            rooms,
            booking_rooms: Arc::new(booking_rooms),
            intents: Arc::new(intents),
            wal_tx,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Log `event` through the group-commit writer, then hand the append
    /// result to `settle`.
    ///
    /// Both steps run on a spawned task that owns whatever `settle` captures
    /// (usually the lock guard), so a caller dropped mid-write cannot leave
    /// the log ahead of memory. The lock is released only after `settle`.
    pub(super) async fn commit<F>(&self, event: Event, settle: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Result<(), EngineError>) + Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        tokio::spawn(async move {
            let logged = wal_append(&wal_tx, event).await;
            settle(&logged);
            logged
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    pub fn get_room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub(super) fn room_or_create(&self, id: RoomId) -> SharedRoomState {
        self.rooms
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(id))))
            .value()
            .clone()
    }

    pub(super) fn get_intent_slot(&self, inv_id: InvoiceId) -> Option<SharedIntent> {
        self.intents.get(&inv_id).map(|e| e.value().clone())
    }

    /// Acquire the write lock of the room holding `booking_id`.
    pub(super) async fn booking_room_write(
        &self,
        booking_id: &BookingId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .booking_rooms
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFound(format!("booking {booking_id}")))?;
        let rs = self
            .get_room(&room_id)
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        tokio::time::timeout(self.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout)
    }
}
