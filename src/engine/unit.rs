use tracing::warn;

use crate::model::*;

use super::ledger::ReservationLedger;
use super::payments::PaymentLedger;

/// A single compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Undo {
    DiscardBooking(BookingId),
    VoidPayment(BookingId),
    RestoreBooking(BookingId, BookingState),
    RestorePayment(BookingId, PaymentState),
}

/// Undo log for one orchestrated operation. Steps are recorded as they succeed
/// and compensated newest-first, while the caller still holds the schedule's
/// write lock, so no other caller sees the partial state.
#[derive(Debug, Default)]
pub(super) struct UnitOfWork {
    undo: Vec<Undo>,
}

impl UnitOfWork {
    pub(super) fn record(&mut self, step: Undo) {
        self.undo.push(step);
    }

    pub(super) fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    pub(super) fn rollback(
        self,
        schedule: &mut DaySchedule,
        ledger: &ReservationLedger,
        payments: &PaymentLedger,
    ) {
        for step in self.undo.into_iter().rev() {
            match step {
                Undo::DiscardBooking(id) => {
                    if ledger.discard(schedule, id).is_none() {
                        warn!(booking_id = id, "rollback: booking already gone");
                    }
                }
                Undo::VoidPayment(id) => {
                    payments.void(id);
                }
                Undo::RestoreBooking(id, state) => ledger.restore(schedule, id, state),
                Undo::RestorePayment(id, state) => payments.restore(id, state),
            }
        }
        metrics::counter!(crate::observability::ROLLBACKS_TOTAL).increment(1);
    }
}
