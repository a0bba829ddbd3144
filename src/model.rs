use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type CourtId = u32;
pub type UserId = u64;
pub type BookingId = u64;
pub type PaymentId = u64;

/// Every booking lives in exactly one schedule: one court on one calendar date.
pub type ScheduleKey = (CourtId, NaiveDate);

/// Half-open time range `[start, end)` on a single calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    /// Unchecked constructor; run `engine::validate_slot` before trusting it.
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn schedule_key(&self, court_id: CourtId) -> ScheduleKey {
        (court_id, self.date)
    }
}

/// A bookable court with its hourly rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: CourtId,
    pub name: String,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingState {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingState {
    /// Pending and confirmed bookings both occupy their slot.
    pub fn is_active(self) -> bool {
        !matches!(self, BookingState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::Confirmed => "confirmed",
            BookingState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub court_id: CourtId,
    pub slot: Slot,
    pub state: BookingState,
}

impl Booking {
    pub fn schedule_key(&self) -> ScheduleKey {
        self.slot.schedule_key(self.court_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Pending,
    Completed,
    Refunded,
}

impl PaymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Completed => "completed",
            PaymentState::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub transaction_ref: String,
    pub state: PaymentState,
}

/// All bookings ever made on one court for one date, cancelled ones included.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub court_id: CourtId,
    pub date: NaiveDate,
    /// Sorted by `slot.start`.
    pub bookings: Vec<Booking>,
}

impl DaySchedule {
    pub fn new(court_id: CourtId, date: NaiveDate) -> Self {
        Self {
            court_id,
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.slot.start <= booking.slot.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings (any state) whose slot intersects `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Slot) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.slot.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.slot.end > query.start)
    }
}

/// Durable log record. Flat, one variant per committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtAdded {
        court: Court,
    },
    BookingCommitted {
        booking: Booking,
        payment: Payment,
    },
    BookingCancelled {
        booking_id: BookingId,
        court_id: CourtId,
        date: NaiveDate,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableCourt {
    pub court: Court,
    /// Informational price of the queried slot; not persisted.
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSummary {
    pub booking: Booking,
    pub court_name: String,
    pub amount: Decimal,
    pub payment_state: PaymentState,
    pub transaction_ref: String,
}
