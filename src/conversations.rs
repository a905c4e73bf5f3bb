use crate::db::{begin_immediate, DbPool};
use crate::error::ApiError;
use crate::models::{Conversation, ConversationSummary, Message, PostMessageRequest, StartConversationRequest};
use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};

pub const MAX_MESSAGE_LENGTH: usize = 1000;

// --- Conversation store ---

async fn fetch_by_pair(
    conn: &mut SqliteConnection,
    user1_id: i64,
    user2_id: i64,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(
        "SELECT * FROM conversations WHERE user1_id = ? AND user2_id = ?",
    )
    .bind(user1_id)
    .bind(user2_id)
    .fetch_optional(conn)
    .await
}

pub async fn get_conversation(
    conn: &mut SqliteConnection,
    conversation_id: i64,
) -> Result<Conversation, ApiError> {
    sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::NotFound("Conversation not found".to_string()))
}

/// Returns the unique conversation for a user pair, creating it if absent.
/// Concurrent creators racing on the same pair converge on one row: a
/// unique violation on insert means someone else created it first, so we
/// re-fetch instead of failing.
pub async fn get_or_create_conversation(
    conn: &mut SqliteConnection,
    user_a_id: i64,
    user_b_id: i64,
) -> Result<Conversation, ApiError> {
    if user_a_id == user_b_id {
        return Err(ApiError::Validation(
            "Cannot start a conversation with yourself".to_string(),
        ));
    }

    let (user1_id, user2_id) = if user_a_id < user_b_id {
        (user_a_id, user_b_id)
    } else {
        (user_b_id, user_a_id)
    };

    if let Some(convo) = fetch_by_pair(&mut *conn, user1_id, user2_id).await? {
        return Ok(convo);
    }

    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO conversations (user1_id, user2_id, created_at, last_message_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user1_id)
    .bind(user2_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(result) => Ok(Conversation {
            id: result.last_insert_rowid(),
            user1_id,
            user2_id,
            created_at: now,
            last_message_at: now,
        }),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            fetch_by_pair(&mut *conn, user1_id, user2_id)
                .await?
                .ok_or(ApiError::Database(sqlx::Error::RowNotFound))
        }
        Err(e) => Err(e.into()),
    }
}

// --- Message ledger ---

/// Appends a message with correct per-slot read flags and bumps the
/// conversation's `last_message_at` in the same transaction.
pub async fn post_message(
    conn: &mut SqliteConnection,
    convo: &Conversation,
    sender_id: i64,
    body: &str,
) -> Result<Message, ApiError> {
    if !convo.is_participant(sender_id) {
        return Err(ApiError::Forbidden(
            "Not a participant in this conversation".to_string(),
        ));
    }

    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::Validation("Message cannot be empty".to_string()));
    }
    if body.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ApiError::Validation("Message is too long".to_string()));
    }

    let sender_is_user1 = convo.user1_id == sender_id;
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO messages (conversation_id, sender_id, body, created_at, read_by_user1, read_by_user2)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(convo.id)
    .bind(sender_id)
    .bind(body)
    .bind(now)
    .bind(sender_is_user1)
    .bind(!sender_is_user1)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE conversations SET last_message_at = ? WHERE id = ?")
        .bind(now)
        .bind(convo.id)
        .execute(&mut *conn)
        .await?;

    Ok(Message {
        id: result.last_insert_rowid(),
        conversation_id: convo.id,
        sender_id,
        body: body.to_string(),
        created_at: now,
        read_by_user1: sender_is_user1,
        read_by_user2: !sender_is_user1,
    })
}

/// Messages ascending by creation time; the rowid breaks ties since two
/// messages can share a timestamp at coarse resolution.
pub async fn list_messages(
    conn: &mut SqliteConnection,
    convo: &Conversation,
    user_id: i64,
) -> Result<Vec<Message>, ApiError> {
    if !convo.is_participant(user_id) {
        return Err(ApiError::Forbidden(
            "Not a participant in this conversation".to_string(),
        ));
    }

    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(convo.id)
    .fetch_all(conn)
    .await?;

    Ok(messages)
}

/// Marks every message in the conversation read for this user's slot.
/// Unconditional bulk update, so repeating it is a no-op.
pub async fn mark_conversation_read(
    conn: &mut SqliteConnection,
    convo: &Conversation,
    user_id: i64,
) -> Result<(), ApiError> {
    if !convo.is_participant(user_id) {
        return Err(ApiError::Forbidden(
            "Not a participant in this conversation".to_string(),
        ));
    }

    let column = if convo.user1_id == user_id {
        "read_by_user1"
    } else {
        "read_by_user2"
    };

    sqlx::query(&format!(
        "UPDATE messages SET {} = TRUE WHERE conversation_id = ?",
        column
    ))
    .bind(convo.id)
    .execute(conn)
    .await?;

    Ok(())
}

// --- Handlers ---

pub async fn start_conversation(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Json(payload): Json<StartConversationRequest>,
) -> Result<Json<Message>, ApiError> {
    let recipient = sqlx::query("SELECT id FROM users WHERE id = ?")
        .bind(payload.recipient_id)
        .fetch_optional(pool.as_ref())
        .await?;
    if recipient.is_none() {
        return Err(ApiError::NotFound("Recipient user not found".to_string()));
    }

    let mut tx = begin_immediate(&pool).await?;
    let convo = get_or_create_conversation(&mut tx, user_id, payload.recipient_id).await?;
    let message = post_message(&mut tx, &convo, user_id, &payload.body).await?;
    tx.commit().await?;

    Ok(Json(message))
}

pub async fn list_conversations(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let convos = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT * FROM conversations
        WHERE user1_id = ? OR user2_id = ?
        ORDER BY last_message_at DESC
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool.as_ref())
    .await?;

    let mut items = Vec::with_capacity(convos.len());
    for convo in convos {
        let other_id = convo.other_user_id(user_id);

        let other_username: String = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(other_id)
            .fetch_optional(pool.as_ref())
            .await?
            .map(|row| row.get("username"))
            .unwrap_or_else(|| "user".to_string());

        let last_message: Option<String> = sqlx::query(
            "SELECT body FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(convo.id)
        .fetch_optional(pool.as_ref())
        .await?
        .map(|row| row.get("body"));

        let unread_column = if convo.user1_id == user_id {
            "read_by_user1"
        } else {
            "read_by_user2"
        };
        let unread_count: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ? AND {} = FALSE AND sender_id != ?",
            unread_column
        ))
        .bind(convo.id)
        .bind(user_id)
        .fetch_one(pool.as_ref())
        .await?
        .get("n");

        items.push(ConversationSummary {
            conversation_id: convo.id,
            other_user_id: other_id,
            other_username,
            last_message: last_message.unwrap_or_default(),
            last_message_at: convo.last_message_at,
            unread_count,
        });
    }

    Ok(Json(items))
}

pub async fn get_messages(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let mut conn = pool.acquire().await?;
    let convo = get_conversation(&mut conn, conversation_id).await?;
    let messages = list_messages(&mut conn, &convo, user_id).await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
    Json(payload): Json<PostMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let mut tx = begin_immediate(&pool).await?;
    let convo = get_conversation(&mut tx, conversation_id).await?;
    let message = post_message(&mut tx, &convo, user_id, &payload.body).await?;
    tx.commit().await?;
    Ok(Json(message))
}

pub async fn mark_read(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = pool.acquire().await?;
    let convo = get_conversation(&mut conn, conversation_id).await?;
    mark_conversation_read(&mut conn, &convo, user_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{seed_user, test_pool};

    #[tokio::test]
    async fn pair_uniqueness_in_either_order() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let c1 = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();
        let c2 = get_or_create_conversation(&mut conn, bob, alice).await.unwrap();
        let c3 = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();

        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.id, c3.id);
        assert!(c1.user1_id < c1.user2_id);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;

        let mut conn = pool.acquire().await.unwrap();
        let err = get_or_create_conversation(&mut conn, alice, alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn read_flags_start_with_sender_read() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();

        // alice seeded first, so she holds the first participant slot
        assert_eq!(convo.user1_id, alice);
        let msg = post_message(&mut conn, &convo, alice, "hi").await.unwrap();
        assert!(msg.read_by_user1);
        assert!(!msg.read_by_user2);

        let reply = post_message(&mut conn, &convo, bob, "hey").await.unwrap();
        assert!(!reply.read_by_user1);
        assert!(reply.read_by_user2);
    }

    #[tokio::test]
    async fn empty_and_oversized_bodies_are_rejected() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();

        let err = post_message(&mut conn, &convo, alice, "   ").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let exactly_max = "x".repeat(MAX_MESSAGE_LENGTH);
        post_message(&mut conn, &convo, alice, &exactly_max)
            .await
            .expect("a body of exactly the limit is accepted");

        let too_long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        let err = post_message(&mut conn, &convo, alice, &too_long).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();
        post_message(&mut conn, &convo, alice, "one").await.unwrap();
        post_message(&mut conn, &convo, alice, "two").await.unwrap();

        mark_conversation_read(&mut conn, &convo, bob).await.unwrap();
        let after_first = list_messages(&mut conn, &convo, bob).await.unwrap();
        assert!(after_first.iter().all(|m| m.read_by_user2));

        mark_conversation_read(&mut conn, &convo, bob).await.unwrap();
        let after_second = list_messages(&mut conn, &convo, bob).await.unwrap();
        assert!(after_second.iter().all(|m| m.read_by_user2));
        assert_eq!(after_first.len(), after_second.len());
    }

    #[tokio::test]
    async fn non_participants_are_forbidden() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;
        let mallory = seed_user(&pool, "mallory").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();

        let err = post_message(&mut conn, &convo, mallory, "hi").await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = list_messages(&mut conn, &convo, mallory).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = mark_conversation_read(&mut conn, &convo, mallory).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn messages_list_in_posting_order() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();
        post_message(&mut conn, &convo, alice, "first").await.unwrap();
        post_message(&mut conn, &convo, bob, "second").await.unwrap();
        post_message(&mut conn, &convo, alice, "third").await.unwrap();

        let messages = list_messages(&mut conn, &convo, alice).await.unwrap();
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn last_message_at_is_bumped_on_post() {
        let pool = test_pool().await;
        let alice = seed_user(&pool, "alice").await;
        let bob = seed_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let convo = get_or_create_conversation(&mut conn, alice, bob).await.unwrap();
        let before = convo.last_message_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        post_message(&mut conn, &convo, alice, "bump").await.unwrap();

        let reloaded = get_conversation(&mut conn, convo.id).await.unwrap();
        assert!(reloaded.last_message_at > before);
    }
}
