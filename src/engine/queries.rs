use chrono::{NaiveDate, NaiveTime};

use crate::model::*;

use super::conflict::validate_slot;
use super::{Engine, EngineError};

impl Engine {
    /// Courts with nothing active over `[start, end)` on `date`, each with the
    /// price that slot would cost.
    pub async fn list_available_courts(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Vec<AvailableCourt>, EngineError> {
        let slot = Slot::new(date, start, end);
        validate_slot(&slot)?;
        Ok(self
            .ledger
            .list_available(&self.catalog, &slot)
            .await
            .into_iter()
            .map(|court| AvailableCourt {
                court: court.clone(),
                price: court.price_for(&slot),
            })
            .collect())
    }

    pub async fn list_user_bookings(&self, user_id: UserId) -> Vec<BookingSummary> {
        self.ledger
            .list_for_user_with(user_id, |booking| {
                let payment = self.payments.get(booking.id)?;
                let court_name = self
                    .catalog
                    .get(booking.court_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                Some((court_name, payment))
            })
            .await
            .into_iter()
            .map(|(booking, (court_name, payment))| BookingSummary {
                booking,
                court_name,
                amount: payment.amount,
                payment_state: payment.state,
                transaction_ref: payment.transaction_ref,
            })
            .collect()
    }

    /// A committed booking and its payment, read under the schedule lock.
    pub async fn get_booking(&self, booking_id: BookingId) -> Option<(Booking, Payment)> {
        let schedule = self.ledger.schedule(&self.ledger.locate(booking_id)?)?;
        let guard = schedule.read().await;
        let booking = guard.get(booking_id)?.clone();
        let payment = self.payments.get(booking_id)?;
        Some((booking, payment))
    }
}
