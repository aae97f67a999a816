use crate::model::*;

use super::Engine;

impl Engine {
    pub async fn get_booking(&self, id: &BookingId) -> Option<Booking> {
        let room_id = *self.booking_rooms.get(id)?.value();
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }

    /// Spans of bookings on `room_id` that still hold the room and overlap
    /// `window`, sorted by start. Unclipped.
    pub async fn busy_spans(&self, room_id: &RoomId, window: &Span) -> Vec<Span> {
        let Some(rs) = self.get_room(room_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.active_overlapping(window).map(Booking::span).collect()
    }

    pub async fn get_intent(&self, inv_id: InvoiceId) -> Option<PaymentIntent> {
        let slot = self.get_intent_slot(inv_id)?;
        let intent = slot.lock().await;
        Some(intent.clone())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_rooms.len()
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }
}
