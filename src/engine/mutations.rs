use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability;

use super::conflict::validate_slot;
use super::ledger::CancelOutcome;
use super::unit::{UnitOfWork, Undo};
use super::{Engine, EngineError};

impl Engine {
    /// Reserve, charge, confirm and settle as one unit. Either the booking
    /// ends up confirmed with a completed payment and a log record, or no
    /// trace of it is left behind.
    pub async fn request_booking(
        &self,
        user_id: UserId,
        court_id: CourtId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<(Booking, Payment), EngineError> {
        let court = self
            .catalog
            .get(court_id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown court {court_id}")))?;
        let slot = Slot::new(date, start, end);
        validate_slot(&slot)?;

        let _gate = self.compaction_gate.read().await;
        let schedule = self.ledger.schedule_or_create(slot.schedule_key(court_id));
        let mut guard = schedule.write().await;

        let mut unit = UnitOfWork::default();
        let result = async {
            let booking = self.ledger.reserve(&mut guard, user_id, slot)?;
            unit.record(Undo::DiscardBooking(booking.id));
            self.payments.charge(booking.id, court, &slot)?;
            unit.record(Undo::VoidPayment(booking.id));
            let booking = self.ledger.confirm(&mut guard, booking.id)?;
            let payment = self.payments.complete(booking.id)?;
            self.wal_append(&Event::BookingCommitted {
                booking: booking.clone(),
                payment: payment.clone(),
            })
            .await?;
            Ok::<_, EngineError>((booking, payment))
        }
        .await;

        match result {
            Ok((booking, payment)) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                info!(
                    booking_id = booking.id,
                    user_id,
                    court_id,
                    %date,
                    "booked {}-{} for {}",
                    start.format("%H:%M"),
                    end.format("%H:%M"),
                    payment.amount
                );
                Ok((booking, payment))
            }
            Err(e) => {
                if let EngineError::Conflict(existing) = e {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    debug!(court_id, %date, existing, "slot taken");
                }
                if !unit.is_empty() {
                    warn!(user_id, court_id, %date, "booking rolled back: {e}");
                    unit.rollback(&mut guard, &self.ledger, &self.payments);
                }
                Err(e)
            }
        }
    }

    /// Cancel a booking and refund its payment. Cancelling an already
    /// cancelled booking succeeds without touching the payment again.
    pub async fn cancel_booking(
        &self,
        user_id: UserId,
        booking_id: BookingId,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.ledger.resolve_write(booking_id).await?;

        let previous = match self.ledger.cancel(&mut guard, booking_id, user_id)? {
            CancelOutcome::AlreadyCancelled => {
                debug!(booking_id, "already cancelled");
                return Ok(());
            }
            CancelOutcome::Cancelled { previous } => previous,
        };

        let mut unit = UnitOfWork::default();
        unit.record(Undo::RestoreBooking(booking_id, previous));
        let result = async {
            let refunded_from = self.payments.refund(booking_id)?;
            unit.record(Undo::RestorePayment(booking_id, refunded_from));
            self.wal_append(&Event::BookingCancelled {
                booking_id,
                court_id: guard.court_id,
                date: guard.date,
            })
            .await
        }
        .await;

        match result {
            Ok(()) => {
                metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
                info!(booking_id, user_id, "cancelled (was {previous})");
                Ok(())
            }
            Err(e) => {
                warn!(booking_id, user_id, "cancellation rolled back: {e}");
                unit.rollback(&mut guard, &self.ledger, &self.payments);
                Err(e)
            }
        }
    }
}
