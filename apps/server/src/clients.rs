//! Per-client statistics, derived from reservation lifecycle events.

use serde::{Deserialize, Serialize};

use crate::models::ReservationStatus;

/// Something that happened to one of the client's reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationEvent {
    Created,
    StatusChanged {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// The reservation was deleted while in status `from`.
    Cancelled { from: ReservationStatus },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClientCounters {
    pub total_appointments: i64,
    pub completed: i64,
    pub attended_with_notice: i64,
    pub no_shows: i64,
    pub cancelled: i64,
}

impl ClientCounters {
    pub fn apply(&mut self, event: ReservationEvent) {
        match event {
            ReservationEvent::Created => self.total_appointments += 1,
            ReservationEvent::StatusChanged { from, to } if from == to => {}
            ReservationEvent::StatusChanged { from, to } => {
                self.leave(from);
                self.enter(to);
            }
            ReservationEvent::Cancelled { from } => {
                self.leave(from);
                self.cancelled += 1;
            }
        }
    }

    fn bucket(&mut self, status: ReservationStatus) -> Option<&mut i64> {
        match status {
            ReservationStatus::Pending => None,
            ReservationStatus::Completed => Some(&mut self.completed),
            ReservationStatus::AttendedWithNotice => Some(&mut self.attended_with_notice),
            ReservationStatus::NoShow => Some(&mut self.no_shows),
            ReservationStatus::Cancelled => Some(&mut self.cancelled),
        }
    }

    fn leave(&mut self, status: ReservationStatus) {
        if let Some(count) = self.bucket(status) {
            *count = (*count - 1).max(0);
        }
    }

    fn enter(&mut self, status: ReservationStatus) {
        if let Some(count) = self.bucket(status) {
            *count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReservationStatus::*;

    #[test]
    fn test_created_bumps_total_only() {
        let mut c = ClientCounters::default();
        c.apply(ReservationEvent::Created);
        assert_eq!(
            c,
            ClientCounters {
                total_appointments: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_pending_to_completed() {
        let mut c = ClientCounters::default();
        c.apply(ReservationEvent::Created);
        c.apply(ReservationEvent::StatusChanged { from: Pending, to: Completed });
        assert_eq!(c.completed, 1);
        assert_eq!(c.total_appointments, 1);
    }

    #[test]
    fn test_correction_moves_between_buckets() {
        let mut c = ClientCounters::default();
        c.apply(ReservationEvent::StatusChanged { from: Pending, to: NoShow });
        c.apply(ReservationEvent::StatusChanged { from: NoShow, to: AttendedWithNotice });
        assert_eq!(c.no_shows, 0);
        assert_eq!(c.attended_with_notice, 1);
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut c = ClientCounters {
            completed: 2,
            ..Default::default()
        };
        c.apply(ReservationEvent::StatusChanged { from: Completed, to: Completed });
        assert_eq!(c.completed, 2);
    }

    #[test]
    fn test_cancel_pending() {
        let mut c = ClientCounters::default();
        c.apply(ReservationEvent::Created);
        c.apply(ReservationEvent::Cancelled { from: Pending });
        assert_eq!(c.cancelled, 1);
        assert_eq!(c.total_appointments, 1);
    }

    #[test]
    fn test_cancel_completed_undoes_completion() {
        let mut c = ClientCounters {
            completed: 1,
            ..Default::default()
        };
        c.apply(ReservationEvent::Cancelled { from: Completed });
        assert_eq!(c.completed, 0);
        assert_eq!(c.cancelled, 1);
    }

    #[test]
    fn test_counters_never_negative() {
        let mut c = ClientCounters::default();
        c.apply(ReservationEvent::StatusChanged { from: NoShow, to: Pending });
        c.apply(ReservationEvent::Cancelled { from: Completed });
        assert_eq!(c.no_shows, 0);
        assert_eq!(c.completed, 0);
    }
}
