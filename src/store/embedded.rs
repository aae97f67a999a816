use async_trait::async_trait;

use crate::booking::BookingChange;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::model::{Booking, BookingId, InvoiceId, PaymentIntent, RoomId, Span};
use crate::payment::{CallbackCheck, Verdict};

use super::{BookingRepository, Modified, PaymentRepository};

#[async_trait]
impl BookingRepository for Engine {
    async fn insert(&self, booking: Booking) -> Result<Booking> {
        Ok(self.insert_booking(booking).await?)
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>> {
        Ok(self.get_booking(&id).await)
    }

    async fn busy_spans(&self, room: RoomId, window: Span) -> Result<Vec<Span>> {
        Ok(Engine::busy_spans(self, &room, &window).await)
    }

    async fn modify(&self, id: BookingId, change: &BookingChange) -> Result<Modified<Booking>> {
        let (record, changed, ()) = self
            .modify_booking(id, |booking| change.apply(booking))
            .await?;
        Ok(Modified { record, changed })
    }

    async fn ping(&self) -> Result<&'static str> {
        Ok("embedded")
    }
}

#[async_trait]
impl PaymentRepository for Engine {
    async fn insert_intent(&self, intent: PaymentIntent) -> Result<PaymentIntent> {
        Ok(Engine::insert_intent(self, intent).await?)
    }

    async fn get_intent(&self, inv_id: InvoiceId) -> Result<Option<PaymentIntent>> {
        Ok(Engine::get_intent(self, inv_id).await)
    }

    async fn reconcile(
        &self,
        inv_id: InvoiceId,
        check: &CallbackCheck,
    ) -> Result<(Modified<PaymentIntent>, Verdict)> {
        let (record, changed, verdict) = self
            .modify_intent(inv_id, |intent| Ok::<_, Error>(check.apply(intent)))
            .await?;
        Ok((Modified { record, changed }, verdict))
    }
}
