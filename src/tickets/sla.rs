//! SLA deadline calculation.
//!
//! The deadline is a pure function of priority at creation time. Later
//! priority changes never move it: SLA commitments do not retroactively
//! shift.

use chrono::{DateTime, Duration, Utc};

use super::TicketPriority;

pub fn sla_deadline(priority: TicketPriority, created_at: DateTime<Utc>) -> DateTime<Utc> {
    let hours = match priority {
        TicketPriority::Low => 72,
        TicketPriority::Medium => 48,
        TicketPriority::High => 24,
        TicketPriority::Urgent => 8,
    };
    created_at + Duration::hours(hours)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_follow_the_priority_table() {
        let created = Utc::now();
        assert_eq!(
            sla_deadline(TicketPriority::Low, created),
            created + Duration::hours(72)
        );
        assert_eq!(
            sla_deadline(TicketPriority::Medium, created),
            created + Duration::hours(48)
        );
        assert_eq!(
            sla_deadline(TicketPriority::High, created),
            created + Duration::hours(24)
        );
        assert_eq!(
            sla_deadline(TicketPriority::Urgent, created),
            created + Duration::hours(8)
        );
    }

    #[test]
    fn unrecognized_priority_falls_back_to_medium() {
        let created = Utc::now();
        let priority = TicketPriority::parse_or_default(Some("banana"));
        assert_eq!(
            sla_deadline(priority, created),
            created + Duration::hours(48)
        );
    }
}
