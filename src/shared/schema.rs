diesel::table! {
    users (id) {
        id -> Uuid,
        username -> Varchar,
        email -> Varchar,
        password_hash -> Varchar,
        role -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        title -> Varchar,
        description -> Text,
        status -> Varchar,
        priority -> Varchar,
        created_by -> Uuid,
        assigned_to -> Nullable<Uuid>,
        comment_ids -> Array<Uuid>,
        timeline -> Jsonb,
        sla_deadline -> Timestamptz,
        version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_comments (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        author_id -> Uuid,
        text -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(tickets -> users (created_by));
diesel::joinable!(ticket_comments -> tickets (ticket_id));
diesel::joinable!(ticket_comments -> users (author_id));

diesel::allow_tables_to_appear_in_same_query!(users, tickets, ticket_comments);
