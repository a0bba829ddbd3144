use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::*;

/// Read-only set of bookable courts, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    courts: Vec<Court>,
}

impl Catalog {
    /// The courts written to a fresh data directory.
    pub fn starter() -> Self {
        let court = |id, name: &str, cents| Court {
            id,
            name: name.to_string(),
            hourly_rate: Decimal::new(cents, 2),
        };
        Self::from_courts(vec![
            court(1, "Court A", 2500),
            court(2, "Court B", 2500),
            court(3, "Court C", 3000),
            court(4, "Court D", 3000),
        ])
    }

    /// Later entries for the same id replace earlier ones.
    pub fn from_courts(courts: Vec<Court>) -> Self {
        let mut sorted: Vec<Court> = Vec::with_capacity(courts.len());
        for court in courts {
            match sorted.binary_search_by_key(&court.id, |c| c.id) {
                Ok(pos) => sorted[pos] = court,
                Err(pos) => sorted.insert(pos, court),
            }
        }
        Self { courts: sorted }
    }

    pub fn get(&self, id: CourtId) -> Option<&Court> {
        self.courts
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|pos| &self.courts[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Court> {
        self.courts.iter()
    }

    pub fn len(&self) -> usize {
        self.courts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courts.is_empty()
    }
}

impl Court {
    pub fn price_for(&self, slot: &Slot) -> Decimal {
        price(self.hourly_rate, slot.duration_minutes())
    }
}

/// `rate × minutes / 60`, rounded half away from zero to cents.
pub fn price(hourly_rate: Decimal, minutes: i64) -> Decimal {
    let mut amount = (hourly_rate * Decimal::from(minutes) / Decimal::from(60))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    amount.rescale(2);
    amount
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn slot(start: (u32, u32), end: (u32, u32)) -> Slot {
        Slot::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        )
    }

    #[test]
    fn starter_set() {
        let catalog = Catalog::starter();
        assert_eq!(catalog.len(), 4);
        let names: Vec<_> = catalog.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Court A", "Court B", "Court C", "Court D"]);
        assert_eq!(catalog.get(3).unwrap().hourly_rate, dec!(30.00));
        assert!(catalog.get(5).is_none());
    }

    fn court(id: CourtId, name: &str, hourly_rate: Decimal) -> Court {
        Court {
            id,
            name: name.into(),
            hourly_rate,
        }
    }

    #[test]
    fn from_courts_sorts_and_replaces() {
        let catalog = Catalog::from_courts(vec![
            court(9, "Nine", dec!(10)),
            court(2, "Two", dec!(10)),
            court(9, "Nine bis", dec!(12)),
        ]);
        let ids: Vec<_> = catalog.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 9]);
        assert_eq!(catalog.get(9).unwrap().name, "Nine bis");
    }

    #[test]
    fn price_ninety_minutes() {
        assert_eq!(price(dec!(25.00), 90), dec!(37.50));
        assert_eq!(price(dec!(25.00), 90).to_string(), "37.50");
    }

    #[test]
    fn price_rounds_to_cents() {
        // 25 × 50 / 60 = 20.8333…
        assert_eq!(price(dec!(25.00), 50), dec!(20.83));
        // 0.05 × 6 / 60 = 0.005 rounds away from zero
        assert_eq!(price(dec!(0.05), 6), dec!(0.01));
    }

    #[test]
    fn price_for_slot() {
        let court = court(3, "Court C", dec!(30.00));
        assert_eq!(court.price_for(&slot((18, 0), (18, 45))), dec!(22.50));
        assert_eq!(court.price_for(&slot((7, 0), (9, 0))).to_string(), "60.00");
    }

    #[test]
    fn free_court_costs_nothing() {
        assert_eq!(price(Decimal::ZERO, 120).to_string(), "0.00");
    }
}
