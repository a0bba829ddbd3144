use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Source of candidate transaction references. Uniqueness is enforced by the
/// ledger, not the generator.
pub trait ReferenceGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Uppercase alphanumeric references from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReferences;

impl ReferenceGenerator for RandomReferences {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..TRANSACTION_REF_LEN)
            .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
            .collect()
    }
}

/// Payment records, one per booking, keyed by booking id.
pub struct PaymentLedger {
    payments: DashMap<BookingId, Payment>,
    /// Every reference ever issued, including those of rolled-back charges.
    references: DashSet<String>,
    next_id: AtomicU64,
    generator: Box<dyn ReferenceGenerator>,
}

impl PaymentLedger {
    pub fn new(generator: Box<dyn ReferenceGenerator>) -> Self {
        Self {
            payments: DashMap::new(),
            references: DashSet::new(),
            next_id: AtomicU64::new(1),
            generator,
        }
    }

    /// Price the slot, claim a unique reference and record a pending payment.
    pub fn charge(
        &self,
        booking_id: BookingId,
        court: &Court,
        slot: &Slot,
    ) -> Result<Payment, EngineError> {
        debug_assert!(!self.payments.contains_key(&booking_id));
        let transaction_ref = self.claim_reference()?;
        let payment = Payment {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            booking_id,
            amount: court.price_for(slot),
            created_at: Utc::now(),
            transaction_ref,
            state: PaymentState::Pending,
        };
        self.payments.insert(booking_id, payment.clone());
        Ok(payment)
    }

    pub fn complete(&self, booking_id: BookingId) -> Result<Payment, EngineError> {
        let mut payment = self
            .payments
            .get_mut(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if payment.state == PaymentState::Refunded {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: payment.state.as_str(),
            });
        }
        payment.state = PaymentState::Completed;
        Ok(payment.clone())
    }

    /// Mark the payment refunded and return the state it had before.
    /// Refunding twice is a no-op that returns `Refunded`.
    pub fn refund(&self, booking_id: BookingId) -> Result<PaymentState, EngineError> {
        let mut payment = self
            .payments
            .get_mut(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let previous = payment.state;
        payment.state = PaymentState::Refunded;
        Ok(previous)
    }

    pub fn get(&self, booking_id: BookingId) -> Option<Payment> {
        self.payments.get(&booking_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }

    /// Drop an uncommitted payment. Its reference stays claimed.
    pub(crate) fn void(&self, booking_id: BookingId) -> Option<Payment> {
        self.payments.remove(&booking_id).map(|(_, p)| p)
    }

    pub(crate) fn restore(&self, booking_id: BookingId, state: PaymentState) {
        if let Some(mut payment) = self.payments.get_mut(&booking_id) {
            payment.state = state;
        }
    }

    /// Load a payment recovered from the log.
    pub(crate) fn insert_replayed(&self, payment: Payment) {
        self.retire_replayed(&payment);
        self.payments.insert(payment.booking_id, payment);
    }

    /// Keep a logged payment's id and reference out of circulation without
    /// loading it.
    pub(crate) fn retire_replayed(&self, payment: &Payment) {
        self.references.insert(payment.transaction_ref.clone());
        self.next_id.fetch_max(payment.id + 1, Ordering::Relaxed);
    }

    fn claim_reference(&self) -> Result<String, EngineError> {
        for attempt in 1..=MAX_REFERENCE_ATTEMPTS {
            match self.reserve_reference(self.generator.generate()) {
                Ok(reference) => return Ok(reference),
                Err(EngineError::DuplicateReference(reference)) => {
                    debug!(attempt, %reference, "transaction reference collision, regenerating");
                    metrics::counter!(crate::observability::REFERENCE_COLLISIONS_TOTAL).increment(1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ReferencesExhausted(MAX_REFERENCE_ATTEMPTS))
    }

    /// Check-and-claim in one step: `DashSet::insert` is atomic per key.
    fn reserve_reference(&self, reference: String) -> Result<String, EngineError> {
        if self.references.insert(reference.clone()) {
            Ok(reference)
        } else {
            Err(EngineError::DuplicateReference(reference))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    /// Hands out the queued references, then repeats the last one forever.
    struct Scripted(Mutex<VecDeque<String>>);

    impl Scripted {
        fn new(refs: &[&str]) -> Box<Self> {
            Box::new(Self(Mutex::new(refs.iter().map(|r| r.to_string()).collect())))
        }
    }

    impl ReferenceGenerator for Scripted {
        fn generate(&self) -> String {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        }
    }

    fn court_a() -> Court {
        Court {
            id: 1,
            name: "Court A".into(),
            hourly_rate: dec!(25.00),
        }
    }

    fn slot(start: (u32, u32), end: (u32, u32)) -> Slot {
        Slot::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        )
    }

    #[test]
    fn random_references_shape() {
        let r = RandomReferences.generate();
        assert_eq!(r.len(), TRANSACTION_REF_LEN);
        assert!(r.bytes().all(|b| REFERENCE_ALPHABET.contains(&b)));
    }

    #[test]
    fn charge_computes_amount() {
        let ledger = PaymentLedger::new(Box::new(RandomReferences));
        let p = ledger.charge(10, &court_a(), &slot((9, 0), (10, 30))).unwrap();
        assert_eq!(p.amount, dec!(37.50));
        assert_eq!(p.booking_id, 10);
        assert_eq!(p.state, PaymentState::Pending);
        assert_eq!(ledger.get(10).unwrap(), p);
    }

    #[test]
    fn collision_regenerates() {
        let ledger = PaymentLedger::new(Scripted::new(&["AAAAAAAAAA", "AAAAAAAAAA", "BBBBBBBBBB"]));
        let first = ledger.charge(1, &court_a(), &slot((9, 0), (10, 0))).unwrap();
        let second = ledger.charge(2, &court_a(), &slot((10, 0), (11, 0))).unwrap();
        assert_eq!(first.transaction_ref, "AAAAAAAAAA");
        assert_eq!(second.transaction_ref, "BBBBBBBBBB");
    }

    #[test]
    fn collision_attempts_are_bounded() {
        let ledger = PaymentLedger::new(Scripted::new(&["SAMESAME00"]));
        ledger.charge(1, &court_a(), &slot((9, 0), (10, 0))).unwrap();
        let err = ledger.charge(2, &court_a(), &slot((10, 0), (11, 0))).unwrap_err();
        assert!(matches!(err, EngineError::ReferencesExhausted(MAX_REFERENCE_ATTEMPTS)));
        assert!(ledger.get(2).is_none());
    }

    #[test]
    fn replayed_references_stay_claimed() {
        let ledger = PaymentLedger::new(Scripted::new(&["OLDREF0001", "NEWREF0002"]));
        ledger.insert_replayed(Payment {
            id: 41,
            booking_id: 5,
            amount: dec!(25.00),
            created_at: Utc::now(),
            transaction_ref: "OLDREF0001".into(),
            state: PaymentState::Completed,
        });
        let p = ledger.charge(6, &court_a(), &slot((9, 0), (10, 0))).unwrap();
        assert_eq!(p.transaction_ref, "NEWREF0002");
        assert_eq!(p.id, 42);
    }

    #[test]
    fn complete_and_refund() {
        let ledger = PaymentLedger::new(Box::new(RandomReferences));
        ledger.charge(1, &court_a(), &slot((9, 0), (10, 0))).unwrap();
        assert_eq!(ledger.complete(1).unwrap().state, PaymentState::Completed);
        assert_eq!(ledger.refund(1).unwrap(), PaymentState::Completed);
        assert_eq!(ledger.refund(1).unwrap(), PaymentState::Refunded);
        assert_eq!(ledger.get(1).unwrap().state, PaymentState::Refunded);
        assert!(matches!(ledger.complete(1), Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn missing_payment_not_found() {
        let ledger = PaymentLedger::new(Box::new(RandomReferences));
        assert!(matches!(ledger.complete(3), Err(EngineError::NotFound(3))));
        assert!(matches!(ledger.refund(3), Err(EngineError::NotFound(3))));
    }

    #[test]
    fn void_keeps_reference_claimed() {
        let ledger = PaymentLedger::new(Scripted::new(&["ONLYONE000"]));
        ledger.charge(1, &court_a(), &slot((9, 0), (10, 0))).unwrap();
        assert!(ledger.void(1).is_some());
        assert!(ledger.is_empty());
        assert!(matches!(
            ledger.charge(2, &court_a(), &slot((9, 0), (10, 0))),
            Err(EngineError::ReferencesExhausted(_))
        ));
    }
}
