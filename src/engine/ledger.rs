use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::catalog::Catalog;
use crate::model::*;

use super::EngineError;
use super::conflict::{check_no_conflict, is_available};

pub type SharedSchedule = Arc<RwLock<DaySchedule>>;

/// What a cancel did to the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { previous: BookingState },
    AlreadyCancelled,
}

/// Authoritative store of bookings. Each (court, date) schedule sits behind its
/// own lock; every mutating method takes the caller's write guard so that the
/// availability check and the write happen under one exclusion region.
pub struct ReservationLedger {
    schedules: DashMap<ScheduleKey, SharedSchedule>,
    /// Reverse lookup: booking id → schedule holding it.
    booking_index: DashMap<BookingId, ScheduleKey>,
    by_user: DashMap<UserId, Vec<BookingId>>,
    next_id: AtomicU64,
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            booking_index: DashMap::new(),
            by_user: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a ledger from schedules recovered at startup. Ids up to
    /// `last_id` are never handed out again, even ones replay dropped.
    pub(crate) fn from_replay(
        schedules: HashMap<ScheduleKey, DaySchedule>,
        last_id: BookingId,
    ) -> Self {
        let ledger = Self::new();
        ledger.next_id.store(last_id + 1, Ordering::Relaxed);
        for (key, schedule) in schedules {
            for booking in &schedule.bookings {
                ledger.index(booking);
            }
            ledger.schedules.insert(key, Arc::new(RwLock::new(schedule)));
        }
        ledger
    }

    pub fn schedule(&self, key: &ScheduleKey) -> Option<SharedSchedule> {
        self.schedules.get(key).map(|e| e.value().clone())
    }

    pub fn schedule_or_create(&self, key: ScheduleKey) -> SharedSchedule {
        self.schedules
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key.0, key.1))))
            .value()
            .clone()
    }

    pub(crate) fn schedules(&self) -> Vec<SharedSchedule> {
        self.schedules.iter().map(|e| e.value().clone()).collect()
    }

    pub fn locate(&self, id: BookingId) -> Option<ScheduleKey> {
        self.booking_index.get(&id).map(|e| *e.value())
    }

    /// Lookup booking → schedule, acquire its write lock.
    pub async fn resolve_write(
        &self,
        id: BookingId,
    ) -> Result<OwnedRwLockWriteGuard<DaySchedule>, EngineError> {
        let key = self.locate(id).ok_or(EngineError::NotFound(id))?;
        let schedule = self.schedule(&key).ok_or(EngineError::NotFound(id))?;
        Ok(schedule.write_owned().await)
    }

    /// Courts free for `slot`, in catalog order.
    pub async fn list_available<'c>(&self, catalog: &'c Catalog, slot: &Slot) -> Vec<&'c Court> {
        let mut free = Vec::new();
        for court in catalog.iter() {
            let Some(schedule) = self.schedule(&slot.schedule_key(court.id)) else {
                free.push(court);
                continue;
            };
            let guard = schedule.read().await;
            if is_available(&guard, slot) {
                free.push(court);
            }
        }
        free
    }

    /// Re-check availability and insert a pending booking with a fresh id.
    pub fn reserve(
        &self,
        schedule: &mut DaySchedule,
        user_id: UserId,
        slot: Slot,
    ) -> Result<Booking, EngineError> {
        check_no_conflict(schedule, &slot)?;

        let booking = Booking {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id,
            court_id: schedule.court_id,
            slot,
            state: BookingState::Pending,
        };
        self.index(&booking);
        schedule.insert_booking(booking.clone());
        Ok(booking)
    }

    pub fn confirm(&self, schedule: &mut DaySchedule, id: BookingId) -> Result<Booking, EngineError> {
        let booking = schedule.get_mut(id).ok_or(EngineError::NotFound(id))?;
        if booking.state != BookingState::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.state.as_str(),
            });
        }
        booking.state = BookingState::Confirmed;
        Ok(booking.clone())
    }

    /// Cancel a booking owned by `user_id`. Cancelling twice is a no-op.
    pub fn cancel(
        &self,
        schedule: &mut DaySchedule,
        id: BookingId,
        user_id: UserId,
    ) -> Result<CancelOutcome, EngineError> {
        let booking = schedule.get_mut(id).ok_or(EngineError::NotFound(id))?;
        if booking.user_id != user_id {
            return Err(EngineError::Forbidden(id));
        }
        if booking.state == BookingState::Cancelled {
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        let previous = booking.state;
        booking.state = BookingState::Cancelled;
        Ok(CancelOutcome::Cancelled { previous })
    }

    /// Drop an uncommitted booking entirely.
    pub(crate) fn discard(&self, schedule: &mut DaySchedule, id: BookingId) -> Option<Booking> {
        let booking = schedule.remove_booking(id)?;
        self.booking_index.remove(&id);
        if let Some(mut ids) = self.by_user.get_mut(&booking.user_id) {
            ids.retain(|b| *b != id);
        }
        Some(booking)
    }

    pub(crate) fn restore(&self, schedule: &mut DaySchedule, id: BookingId, state: BookingState) {
        if let Some(booking) = schedule.get_mut(id) {
            booking.state = state;
        }
    }

    pub async fn get(&self, id: BookingId) -> Option<Booking> {
        let schedule = self.schedule(&self.locate(id)?)?;
        let guard = schedule.read().await;
        guard.get(id).cloned()
    }

    /// A user's bookings, newest (date, start) first.
    pub async fn list_for_user(&self, user_id: UserId) -> Vec<Booking> {
        self.list_for_user_with(user_id, |_| Some(()))
            .await
            .into_iter()
            .map(|(booking, ())| booking)
            .collect()
    }

    /// Like `list_for_user`, pairing each booking with `join`'s result. `join`
    /// runs while the booking's schedule is read-locked, so it observes the
    /// same committed state as the booking itself.
    pub async fn list_for_user_with<T>(
        &self,
        user_id: UserId,
        mut join: impl FnMut(&Booking) -> Option<T>,
    ) -> Vec<(Booking, T)> {
        let ids = self
            .by_user
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(schedule) = self.locate(id).and_then(|key| self.schedule(&key)) else {
                continue;
            };
            let guard = schedule.read().await;
            // Gone if it was rolled back while we waited for the lock.
            if let Some(booking) = guard.get(id)
                && let Some(extra) = join(booking)
            {
                rows.push((booking.clone(), extra));
            }
        }
        rows.sort_by(|(a, _), (b, _)| {
            (b.slot.date, b.slot.start, b.id).cmp(&(a.slot.date, a.slot.start, a.id))
        });
        rows
    }

    fn index(&self, booking: &Booking) {
        self.booking_index.insert(booking.id, booking.schedule_key());
        self.by_user.entry(booking.user_id).or_default().push(booking.id);
        self.next_id.fetch_max(booking.id + 1, Ordering::Relaxed);
    }
}
