use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, oneshot};

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, validate_span};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Insert a new booking. The overlap check and the write happen under the
    /// room's write lock, so concurrent inserts on one room serialize here and
    /// at most one of two overlapping candidates is stored.
    pub async fn insert_booking(&self, booking: Booking) -> Result<Booking, EngineError> {
        let span = booking.span();
        validate_span(&span)?;
        if self.booking_rooms.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(format!("booking {}", booking.id)));
        }

        let rs = self.room_or_create(booking.room_id);
        let mut guard = tokio::time::timeout(self.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if booking.status.holds_slot() {
            check_no_overlap(&guard, &span)?;
        }

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        let booking_rooms = self.booking_rooms.clone();
        let stored = booking.clone();
        self.commit(event, move |logged| {
            if logged.is_ok() {
                booking_rooms.insert(stored.id, stored.room_id);
                guard.insert_booking(stored);
            }
        })
        .await?;
        Ok(booking)
    }

    /// Read-modify-write one booking under its room's write lock.
    ///
    /// `f` edits a copy. The copy is logged and stored only when it differs
    /// from the current record; the returned flag says whether it did. An
    /// error from `f` leaves the record untouched.
    pub async fn modify_booking<T, E>(
        &self,
        id: BookingId,
        f: impl FnOnce(&mut Booking) -> Result<T, E>,
    ) -> Result<(Booking, bool, T), E>
    where
        E: From<EngineError>,
    {
        let mut guard = self.booking_room_write(&id).await?;
        let current = guard
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;

        let mut next = current.clone();
        let out = f(&mut next)?;
        if next == current {
            return Ok((current, false, out));
        }
        if next.span() != current.span() || next.room_id != current.room_id {
            return Err(EngineError::LimitExceeded("booking time and room are fixed").into());
        }

        let event = Event::BookingChanged {
            booking: next.clone(),
        };
        let stored = next.clone();
        self.commit(event, move |logged| {
            if logged.is_ok() {
                guard.replace_booking(stored);
            }
        })
        .await?;
        Ok((next, true, out))
    }

    /// Store a new payment intent. Fails if the invoice id is already taken.
    pub async fn insert_intent(&self, intent: PaymentIntent) -> Result<PaymentIntent, EngineError> {
        if intent.shp_params.len() > MAX_SHP_PARAMS {
            return Err(EngineError::LimitExceeded("too many custom parameters"));
        }

        // The slot is published already locked so no reader sees it before
        // the WAL has it.
        let slot = Arc::new(Mutex::new(intent.clone()));
        let guard = slot
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::LockTimeout)?;
        match self.intents.entry(intent.inv_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(format!("invoice {}", intent.inv_id)));
            }
            Entry::Vacant(v) => {
                v.insert(slot);
            }
        }

        let event = Event::IntentCreated {
            intent: intent.clone(),
        };
        let intents = self.intents.clone();
        let inv_id = intent.inv_id;
        self.commit(event, move |logged| {
            if logged.is_err() {
                intents.remove(&inv_id);
            }
            drop(guard);
        })
        .await?;
        Ok(intent)
    }

    /// Read-modify-write one intent under its invoice mutex. Same contract as
    /// [`Engine::modify_booking`]. Waiting longer than the lock timeout fails
    /// with [`EngineError::LockTimeout`].
    pub async fn modify_intent<T, E>(
        &self,
        inv_id: InvoiceId,
        f: impl FnOnce(&mut PaymentIntent) -> Result<T, E>,
    ) -> Result<(PaymentIntent, bool, T), E>
    where
        E: From<EngineError>,
    {
        let slot = self
            .get_intent_slot(inv_id)
            .ok_or_else(|| EngineError::NotFound(format!("invoice {inv_id}")))?;
        let mut guard = tokio::time::timeout(self.lock_timeout, slot.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout)?;

        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next == *guard {
            return Ok((next, false, out));
        }

        let event = Event::IntentChanged {
            intent: next.clone(),
        };
        let stored = next.clone();
        self.commit(event, move |logged| {
            if logged.is_ok() {
                *guard = stored;
            }
        })
        .await?;
        Ok((next, true, out))
    }

    /// Rewrite the WAL from current state. Writes that race with the snapshot
    /// may be dropped from the log, so call it only with writers quiesced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }
        let mut slots: Vec<_> = self
            .intents
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        slots.sort_by_key(|(id, _)| *id);
        for (_, slot) in slots {
            let intent = slot.lock().await.clone();
            events.push(Event::IntentCreated { intent });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
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
