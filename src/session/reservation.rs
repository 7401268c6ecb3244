//! Reservation manager — a session owns at most one reservation at a time.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct ReservationRecord {
    pub reservation_id: i32,
    pub id_tag: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ReservationManager {
    active: Option<ReservationRecord>,
}

impl ReservationManager {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn active(&self) -> Option<&ReservationRecord> {
        self.active.as_ref()
    }

    pub fn install(&mut self, reservation_id: i32, id_tag: String, expiry: DateTime<Utc>) {
        self.active = Some(ReservationRecord {
            reservation_id,
            id_tag,
            expiry,
        });
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.active.as_ref().is_some_and(|r| now >= r.expiry)
    }

    /// Clear and return the reservation if its id matches.
    pub fn cancel_by_id(&mut self, reservation_id: i32) -> bool {
        if self.active.as_ref().is_some_and(|r| r.reservation_id == reservation_id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Consume the reservation if `id_tag` matches the holder, as happens
    /// when an Authorize for that tag arrives while the session is reserved.
    pub fn consume_if_matches(&mut self, id_tag: &str) -> bool {
        if self.active.as_ref().is_some_and(|r| r.id_tag == id_tag) {
            self.active = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn consumes_reservation_on_matching_authorize() {
        let mut mgr = ReservationManager::new();
        mgr.install(42, "TAG_X".into(), Utc::now() + Duration::minutes(5));

        assert!(!mgr.consume_if_matches("TAG_Y"));
        assert!(mgr.active().is_some());

        assert!(mgr.consume_if_matches("TAG_X"));
        assert!(mgr.active().is_none());
    }

    #[test]
    fn expiry_detection() {
        let mut mgr = ReservationManager::new();
        mgr.install(1, "TAG".into(), Utc::now() - Duration::seconds(1));
        assert!(mgr.is_expired(Utc::now()));
    }

    #[test]
    fn cancel_by_id_requires_match() {
        let mut mgr = ReservationManager::new();
        mgr.install(7, "TAG".into(), Utc::now() + Duration::minutes(1));
        assert!(!mgr.cancel_by_id(8));
        assert!(mgr.cancel_by_id(7));
        assert!(mgr.active().is_none());
    }
}
