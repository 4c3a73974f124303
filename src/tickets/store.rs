//! Ticket persistence, including the optimistic-concurrency update
//! primitive.
//!
//! The version-gated update is a single conditional `UPDATE ... WHERE id AND
//! version ... RETURNING`; the row match is the only serialization point, so
//! of two concurrent writers starting from the same version exactly one
//! commits and the other sees no matching row. Timeline appends and comment
//! linking are separate, strictly additive writes that do not re-check the
//! version.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::{Comment, Ticket, TicketPriority, TicketStatus, TimelineEvent};
use crate::shared::schema::{ticket_comments, tickets, users};

/// Field changes requested by a ticket update. `None` means "leave as is".
#[derive(Debug, Clone, Default)]
pub struct UpdateChanges {
    pub status: Option<TicketStatus>,
    pub assigned_to: Option<Uuid>,
    pub priority: Option<TicketPriority>,
}

#[derive(AsChangeset)]
#[diesel(table_name = tickets)]
struct TicketChangeset {
    status: Option<String>,
    assigned_to: Option<Uuid>,
    priority: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

pub fn find_ticket(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Ticket>> {
    tickets::table
        .filter(tickets::id.eq(id))
        .first(conn)
        .optional()
}

/// Conditional update: applies `changes` only if the stored version still
/// equals `expected_version`, incrementing the version in the same
/// statement. Returns `None` when no row matched the id+version pair, i.e.
/// a concurrent writer got there first.
pub fn apply_update(
    conn: &mut PgConnection,
    id: Uuid,
    expected_version: i64,
    changes: &UpdateChanges,
) -> QueryResult<Option<Ticket>> {
    let changeset = TicketChangeset {
        status: changes.status.map(|s| s.as_str().to_string()),
        assigned_to: changes.assigned_to,
        priority: changes.priority.map(|p| p.as_str().to_string()),
        version: expected_version + 1,
        updated_at: Utc::now(),
    };

    diesel::update(
        tickets::table
            .filter(tickets::id.eq(id))
            .filter(tickets::version.eq(expected_version)),
    )
    .set(&changeset)
    .get_result(conn)
    .optional()
}

pub fn parse_timeline(value: &serde_json::Value) -> Vec<TimelineEvent> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Appends events to a ticket's timeline. Additive only — no version check.
pub fn append_timeline(
    conn: &mut PgConnection,
    ticket: &Ticket,
    events: &[TimelineEvent],
) -> QueryResult<Ticket> {
    let mut timeline = parse_timeline(&ticket.timeline);
    timeline.extend(events.iter().cloned());
    let value = serde_json::to_value(&timeline)
        .map_err(|e| diesel::result::Error::SerializationError(Box::new(e)))?;

    diesel::update(tickets::table.filter(tickets::id.eq(ticket.id)))
        .set(tickets::timeline.eq(value))
        .get_result(conn)
}

pub fn insert_comment(conn: &mut PgConnection, comment: &Comment) -> QueryResult<()> {
    diesel::insert_into(ticket_comments::table)
        .values(comment)
        .execute(conn)
        .map(|_| ())
}

/// Links a persisted comment to its ticket: pushes the comment reference and
/// one timeline event in a single write.
pub fn link_comment(
    conn: &mut PgConnection,
    ticket: &Ticket,
    comment_id: Uuid,
    event: TimelineEvent,
) -> QueryResult<Ticket> {
    let mut comment_ids = ticket.comment_ids.clone();
    comment_ids.push(comment_id);

    let mut timeline = parse_timeline(&ticket.timeline);
    timeline.push(event);
    let value = serde_json::to_value(&timeline)
        .map_err(|e| diesel::result::Error::SerializationError(Box::new(e)))?;

    diesel::update(tickets::table.filter(tickets::id.eq(ticket.id)))
        .set((
            tickets::comment_ids.eq(comment_ids),
            tickets::timeline.eq(value),
            tickets::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
}

pub fn lookup_username(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<Option<String>> {
    users::table
        .filter(users::id.eq(user_id))
        .select(users::username)
        .first(conn)
        .optional()
}

/// Comments for a ticket in insertion order, each with its author's
/// identity.
pub fn load_comments_with_authors(
    conn: &mut PgConnection,
    ticket_id: Uuid,
) -> QueryResult<Vec<(Comment, (Uuid, String, String))>> {
    ticket_comments::table
        .inner_join(users::table)
        .filter(ticket_comments::ticket_id.eq(ticket_id))
        .order(ticket_comments::created_at.asc())
        .select((
            ticket_comments::all_columns,
            (users::id, users::username, users::email),
        ))
        .load(conn)
}
