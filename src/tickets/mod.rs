pub mod sla;
pub mod store;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::middleware::require_any_role;
use crate::auth::{protect, AuthenticatedUser, Role};
use crate::rate_limit::rate_limit_middleware;
use crate::shared::errors::ApiError;
use crate::shared::schema::{ticket_comments, tickets};
use crate::shared::state::AppState;

use store::UpdateChanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
            TicketPriority::Urgent => "urgent",
        }
    }

    /// Omitted or unrecognized priorities fall back to `medium`.
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s {
            Some("low") => TicketPriority::Low,
            Some("high") => TicketPriority::High,
            Some("urgent") => TicketPriority::Urgent,
            _ => TicketPriority::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = tickets)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub created_by: Uuid,
    pub assigned_to: Option<Uuid>,
    #[serde(rename = "comments")]
    pub comment_ids: Vec<Uuid>,
    pub timeline: serde_json::Value,
    pub sla_deadline: DateTime<Utc>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_comments)]
pub struct Comment {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub author_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub actor: Uuid,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTicketRequest {
    pub status: Option<TicketStatus>,
    pub assigned_to: Option<Uuid>,
    pub priority: Option<TicketPriority>,
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub items: Vec<Ticket>,
    pub next_offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorInfo {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentResponse {
    pub id: Uuid,
    pub text: String,
    pub author: AuthorInfo,
    pub ticket: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TicketWithComments {
    pub ticket: Ticket,
    pub comments: Vec<CommentResponse>,
}

pub fn configure(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tickets", post(create_ticket).get(list_tickets))
        .route("/tickets/:id", get(get_ticket).patch(update_ticket))
        .route("/tickets/:id/comments", post(add_comment))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state, protect))
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let (title, description) = match (req.title, req.description) {
        (Some(t), Some(d)) if !t.trim().is_empty() && !d.trim().is_empty() => {
            (t.trim().to_string(), d)
        }
        _ => {
            return Err(ApiError::FieldRequired(
                "Title and description are required".into(),
            ))
        }
    };

    let priority = TicketPriority::parse_or_default(req.priority.as_deref());
    let now = Utc::now();
    let events = vec![TimelineEvent {
        actor: user.id,
        action: "Ticket created".into(),
        timestamp: now,
    }];

    let ticket = Ticket {
        id: Uuid::new_v4(),
        title,
        description,
        status: TicketStatus::New.as_str().to_string(),
        priority: priority.as_str().to_string(),
        created_by: user.id,
        assigned_to: None,
        comment_ids: Vec::new(),
        timeline: serde_json::to_value(&events)
            .map_err(|e| anyhow::anyhow!("timeline serialization failed: {e}"))?,
        sla_deadline: sla::sla_deadline(priority, now),
        version: 0,
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.conn.get()?;
    diesel::insert_into(tickets::table)
        .values(&ticket)
        .execute(&mut conn)?;

    Ok((StatusCode::CREATED, Json(ticket)))
}

fn filtered_tickets(
    user: &AuthenticatedUser,
    search: Option<&str>,
) -> tickets::BoxedQuery<'static, Pg> {
    let mut query = tickets::table.into_boxed();

    if user.role == Role::User {
        query = query.filter(tickets::created_by.eq(user.id));
    }

    if let Some(term) = search {
        if !term.is_empty() {
            let pattern = format!("%{term}%");
            query = query.filter(
                tickets::title
                    .ilike(pattern.clone())
                    .or(tickets::description.ilike(pattern)),
            );
        }
    }

    query
}

fn next_offset(offset: i64, fetched: usize, total: i64) -> Option<i64> {
    let end = offset + fetched as i64;
    if end < total {
        Some(end)
    } else {
        None
    }
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(10).max(0);
    let offset = query.offset.unwrap_or(0).max(0);
    let search = query.search.as_deref();

    let mut conn = state.conn.get()?;

    let total: i64 = filtered_tickets(&user, search)
        .count()
        .get_result(&mut conn)?;

    let items: Vec<Ticket> = filtered_tickets(&user, search)
        .order(tickets::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load(&mut conn)?;

    let next_offset = next_offset(offset, items.len(), total);

    Ok(Json(ListResponse { items, next_offset }))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<TicketWithComments>, ApiError> {
    let ticket_id = Uuid::parse_str(&id).map_err(|_| ApiError::InvalidId)?;

    let mut conn = state.conn.get()?;
    let ticket = store::find_ticket(&mut conn, ticket_id)?
        .ok_or_else(|| ApiError::NotFound("Ticket not found".into()))?;

    if !user.can_access_ticket(ticket.created_by) {
        return Err(ApiError::Forbidden(
            "You are not authorized to view this ticket".into(),
        ));
    }

    let comments = store::load_comments_with_authors(&mut conn, ticket_id)?
        .into_iter()
        .map(|(comment, (author_id, username, email))| CommentResponse {
            id: comment.id,
            text: comment.text,
            author: AuthorInfo {
                id: author_id,
                username,
                email,
            },
            ticket: comment.ticket_id,
            created_at: comment.created_at,
        })
        .collect();

    Ok(Json(TicketWithComments { ticket, comments }))
}

pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    require_any_role(&user, &[Role::Agent, Role::Admin])?;

    let version = req.version.ok_or(ApiError::VersionRequired)?;
    let ticket_id = Uuid::parse_str(&id).map_err(|_| ApiError::InvalidId)?;

    let changes = UpdateChanges {
        status: req.status,
        assigned_to: req.assigned_to,
        priority: req.priority,
    };

    let mut conn = state.conn.get()?;

    let snapshot = store::find_ticket(&mut conn, ticket_id)?
        .ok_or_else(|| ApiError::NotFound("Ticket not found".into()))?;

    let updated = store::apply_update(&mut conn, ticket_id, version, &changes)?
        .ok_or(ApiError::Conflict)?;

    let events = build_update_events(&mut conn, &user, &snapshot, &changes);
    if events.is_empty() {
        return Ok(Json(updated));
    }

    // The primary mutation is committed; a lost timeline append is logged,
    // never surfaced to the caller.
    match store::append_timeline(&mut conn, &updated, &events) {
        Ok(ticket) => Ok(Json(ticket)),
        Err(e) => {
            error!("timeline append failed for ticket {ticket_id}, {} event(s) lost: {e}", events.len());
            Ok(Json(updated))
        }
    }
}

fn build_update_events(
    conn: &mut PgConnection,
    actor: &AuthenticatedUser,
    snapshot: &Ticket,
    changes: &UpdateChanges,
) -> Vec<TimelineEvent> {
    let assignee_name = match changes.assigned_to {
        Some(assignee) if snapshot.assigned_to != Some(assignee) => {
            match store::lookup_username(conn, assignee) {
                Ok(Some(name)) => Some(name),
                Ok(None) => {
                    warn!("assignee {assignee} has no user record, rendering raw id");
                    None
                }
                Err(e) => {
                    warn!("assignee lookup for {assignee} failed, rendering raw id: {e}");
                    None
                }
            }
        }
        _ => None,
    };

    diff_timeline_events(
        actor.id,
        Utc::now(),
        snapshot,
        changes,
        assignee_name.as_deref(),
    )
}

/// One event per changed field, in status / assignee / priority order.
/// Status and priority name the old and new raw values; assignment renders
/// the assignee's resolved display name.
pub fn diff_timeline_events(
    actor: Uuid,
    now: DateTime<Utc>,
    snapshot: &Ticket,
    changes: &UpdateChanges,
    assignee_name: Option<&str>,
) -> Vec<TimelineEvent> {
    let mut events = Vec::new();

    if let Some(status) = changes.status {
        if snapshot.status != status.as_str() {
            events.push(TimelineEvent {
                actor,
                action: format!(
                    "Status changed from '{}' to '{}'",
                    snapshot.status,
                    status.as_str()
                ),
                timestamp: now,
            });
        }
    }

    if let Some(assignee) = changes.assigned_to {
        if snapshot.assigned_to != Some(assignee) {
            let name = assignee_name
                .map(str::to_owned)
                .unwrap_or_else(|| assignee.to_string());
            events.push(TimelineEvent {
                actor,
                action: format!("Assigned to {name}"),
                timestamp: now,
            });
        }
    }

    if let Some(priority) = changes.priority {
        if snapshot.priority != priority.as_str() {
            events.push(TimelineEvent {
                actor,
                action: format!(
                    "Priority changed from '{}' to '{}'",
                    snapshot.priority,
                    priority.as_str()
                ),
                timestamp: now,
            });
        }
    }

    events
}

pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<CommentResponse>), ApiError> {
    let text = match req.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(ApiError::FieldRequired("Comment text is required".into())),
    };

    let ticket_id = Uuid::parse_str(&id).map_err(|_| ApiError::InvalidId)?;

    let mut conn = state.conn.get()?;
    let ticket = store::find_ticket(&mut conn, ticket_id)?
        .ok_or_else(|| ApiError::NotFound("Ticket not found".into()))?;

    if !user.can_access_ticket(ticket.created_by) {
        return Err(ApiError::Forbidden(
            "You are not authorized to comment on this ticket".into(),
        ));
    }

    let now = Utc::now();
    let comment = Comment {
        id: Uuid::new_v4(),
        ticket_id,
        author_id: user.id,
        text,
        created_at: now,
    };
    store::insert_comment(&mut conn, &comment)?;

    let event = TimelineEvent {
        actor: user.id,
        action: "Commented".into(),
        timestamp: now,
    };
    // Comment and ticket link are two writes, not one transaction. The
    // comment is already visible; a failed link is logged for
    // reconciliation instead of rolled back.
    if let Err(e) = store::link_comment(&mut conn, &ticket, comment.id, event) {
        error!("comment {} created but not linked to ticket {ticket_id}: {e}", comment.id);
    }

    Ok((
        StatusCode::CREATED,
        Json(CommentResponse {
            id: comment.id,
            text: comment.text,
            author: AuthorInfo {
                id: user.id,
                username: user.username,
                email: user.email,
            },
            ticket: ticket_id,
            created_at: now,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_ticket(status: &str, priority: &str, assigned_to: Option<Uuid>) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            title: "Printer on fire".into(),
            description: "It is actually on fire".into(),
            status: status.into(),
            priority: priority.into(),
            created_by: Uuid::new_v4(),
            assigned_to,
            comment_ids: Vec::new(),
            timeline: serde_json::json!([]),
            sla_deadline: now,
            version: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_change_names_old_and_new_value() {
        let snapshot = snapshot_ticket("new", "medium", None);
        let changes = UpdateChanges {
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        };
        let events = diff_timeline_events(Uuid::new_v4(), Utc::now(), &snapshot, &changes, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "Status changed from 'new' to 'resolved'");
    }

    #[test]
    fn status_and_assignee_change_appends_two_events_in_order() {
        let snapshot = snapshot_ticket("new", "medium", None);
        let agent = Uuid::new_v4();
        let changes = UpdateChanges {
            status: Some(TicketStatus::InProgress),
            assigned_to: Some(agent),
            priority: None,
        };
        let events =
            diff_timeline_events(Uuid::new_v4(), Utc::now(), &snapshot, &changes, Some("alice"));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].action,
            "Status changed from 'new' to 'in_progress'"
        );
        assert_eq!(events[1].action, "Assigned to alice");
    }

    #[test]
    fn unchanged_fields_produce_no_events() {
        let agent = Uuid::new_v4();
        let snapshot = snapshot_ticket("in_progress", "high", Some(agent));
        let changes = UpdateChanges {
            status: Some(TicketStatus::InProgress),
            assigned_to: Some(agent),
            priority: Some(TicketPriority::High),
        };
        let events = diff_timeline_events(Uuid::new_v4(), Utc::now(), &snapshot, &changes, None);
        assert!(events.is_empty());
    }

    #[test]
    fn missing_assignee_record_renders_raw_id() {
        let snapshot = snapshot_ticket("new", "medium", None);
        let agent = Uuid::new_v4();
        let changes = UpdateChanges {
            assigned_to: Some(agent),
            ..Default::default()
        };
        let events = diff_timeline_events(Uuid::new_v4(), Utc::now(), &snapshot, &changes, None);
        assert_eq!(events[0].action, format!("Assigned to {agent}"));
    }

    #[test]
    fn priority_change_uses_raw_values() {
        let snapshot = snapshot_ticket("new", "low", None);
        let changes = UpdateChanges {
            priority: Some(TicketPriority::Urgent),
            ..Default::default()
        };
        let events = diff_timeline_events(Uuid::new_v4(), Utc::now(), &snapshot, &changes, None);
        assert_eq!(events[0].action, "Priority changed from 'low' to 'urgent'");
    }

    #[test]
    fn next_offset_is_null_once_exhausted() {
        assert_eq!(next_offset(0, 10, 25), Some(10));
        assert_eq!(next_offset(10, 10, 25), Some(20));
        assert_eq!(next_offset(20, 5, 25), None);
        assert_eq!(next_offset(0, 0, 0), None);
    }

    #[test]
    fn priority_parse_defaults_to_medium() {
        assert_eq!(TicketPriority::parse_or_default(None), TicketPriority::Medium);
        assert_eq!(
            TicketPriority::parse_or_default(Some("banana")),
            TicketPriority::Medium
        );
        assert_eq!(
            TicketPriority::parse_or_default(Some("urgent")),
            TicketPriority::Urgent
        );
    }

    #[test]
    fn ticket_serializes_with_camel_case_wire_names() {
        let ticket = snapshot_ticket("new", "medium", None);
        let value = serde_json::to_value(&ticket).unwrap();
        assert!(value.get("slaDeadline").is_some());
        assert!(value.get("createdBy").is_some());
        assert!(value.get("comments").is_some());
        assert!(value.get("version").is_some());
        assert!(value.get("comment_ids").is_none());
    }

    #[test]
    fn timeline_roundtrips_through_jsonb_value() {
        let events = vec![TimelineEvent {
            actor: Uuid::new_v4(),
            action: "Ticket created".into(),
            timestamp: Utc::now(),
        }];
        let value = serde_json::to_value(&events).unwrap();
        let parsed = store::parse_timeline(&value);
        assert_eq!(parsed, events);
    }
}
