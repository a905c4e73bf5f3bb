use crate::db::DbPool;
use crate::error::ApiError;
use crate::models::ListingUnreadCount;
use axum::{
    extract::{Extension, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqliteConnection;

/// Which dashboard the unread counts are for: notifications about requests
/// to the recipient's own listings, or about the recipient's requests on
/// other people's listings.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationRole {
    Owner,
    Requester,
}

pub async fn notify(
    conn: &mut SqliteConnection,
    recipient_id: i64,
    listing_id: i64,
    text: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO listing_notifications (listing_id, recipient_id, message, is_read, created_at) VALUES (?, ?, ?, FALSE, ?)",
    )
    .bind(listing_id)
    .bind(recipient_id)
    .bind(text)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn mark_listing_notifications_read(
    conn: &mut SqliteConnection,
    listing_id: i64,
    recipient_id: i64,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE listing_notifications SET is_read = TRUE WHERE listing_id = ? AND recipient_id = ? AND is_read = FALSE",
    )
    .bind(listing_id)
    .bind(recipient_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Unread notification counts per listing, split by whether the recipient
/// owns the listing. Ownership goes through the owner's profile row, the
/// same join the dashboards use.
pub async fn unread_counts_by_listing(
    conn: &mut SqliteConnection,
    recipient_id: i64,
    role: NotificationRole,
) -> Result<Vec<ListingUnreadCount>, ApiError> {
    let owner_filter = match role {
        NotificationRole::Owner => "p.user_id = ?",
        NotificationRole::Requester => "p.user_id != ?",
    };

    let counts = sqlx::query_as::<_, ListingUnreadCount>(&format!(
        r#"
        SELECT n.listing_id AS listing_id, COUNT(*) AS unread_count
        FROM listing_notifications n
        JOIN listings l ON n.listing_id = l.id
        JOIN profiles p ON l.profile_id = p.id
        WHERE n.recipient_id = ? AND n.is_read = FALSE AND {}
        GROUP BY n.listing_id
        "#,
        owner_filter
    ))
    .bind(recipient_id)
    .bind(recipient_id)
    .fetch_all(conn)
    .await?;

    Ok(counts)
}

// --- Handler ---

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    pub role: NotificationRole,
}

pub async fn unread_counts(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Query(query): Query<UnreadQuery>,
) -> Result<Json<Vec<ListingUnreadCount>>, ApiError> {
    let mut conn = pool.acquire().await?;
    let counts = unread_counts_by_listing(&mut conn, user_id, query.role).await?;
    Ok(Json(counts))
}
