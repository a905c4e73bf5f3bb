use crate::auth::get_user_id_from_token;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::models::{BookingRequest, CreateListingRequest, Listing, ListingDetailResponse};
use crate::notifications::mark_listing_notifications_read;
use axum::{
    extract::{Extension, Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};

/// The actor's relationship to a listing, resolved once per operation
/// instead of scattering user-id comparisons through the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Requester,
    Unrelated,
}

pub async fn get_listing(
    conn: &mut SqliteConnection,
    listing_id: i64,
) -> Result<Listing, ApiError> {
    sqlx::query_as::<_, Listing>("SELECT * FROM listings WHERE id = ?")
        .bind(listing_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::NotFound("Listing not found".to_string()))
}

/// Listing ownership is profile-mediated: the owner is the user behind the
/// listing's profile.
pub async fn listing_owner_user_id(
    conn: &mut SqliteConnection,
    listing: &Listing,
) -> Result<i64, ApiError> {
    let row = sqlx::query("SELECT user_id FROM profiles WHERE id = ?")
        .bind(listing.profile_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::NotFound("Listing owner not found".to_string()))?;

    Ok(row.get("user_id"))
}

pub async fn resolve_role(
    conn: &mut SqliteConnection,
    actor_id: i64,
    listing: &Listing,
) -> Result<Role, ApiError> {
    let owner_id = listing_owner_user_id(&mut *conn, listing).await?;
    if actor_id == owner_id {
        return Ok(Role::Owner);
    }

    let has_request =
        sqlx::query("SELECT 1 FROM booking_requests WHERE listing_id = ? AND requester_id = ?")
            .bind(listing.id)
            .bind(actor_id)
            .fetch_optional(conn)
            .await?
            .is_some();

    Ok(if has_request {
        Role::Requester
    } else {
        Role::Unrelated
    })
}

// --- Handlers ---

pub async fn create_listing(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Json(payload): Json<CreateListingRequest>,
) -> Result<Json<Listing>, ApiError> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(ApiError::Validation("Title cannot be empty".to_string()));
    }

    let profile = sqlx::query("SELECT id FROM profiles WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool.as_ref())
        .await?
        .ok_or_else(|| ApiError::NotFound("Profile not found".to_string()))?;
    let profile_id: i64 = profile.get("id");

    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO listings (profile_id, title, city, description, is_archived, created_at) VALUES (?, ?, ?, ?, FALSE, ?)",
    )
    .bind(profile_id)
    .bind(title)
    .bind(&payload.city)
    .bind(&payload.description)
    .bind(now)
    .execute(pool.as_ref())
    .await?;

    Ok(Json(Listing {
        id: result.last_insert_rowid(),
        profile_id,
        title: title.to_string(),
        city: payload.city,
        description: payload.description,
        is_archived: false,
        created_at: now,
    }))
}

/// Listing detail. Anonymous viewers see non-archived listings only; an
/// archived listing stays visible to its owner and to the accepted
/// requester, and reads as missing to everyone else. Viewing marks the
/// viewer's notifications for this listing read.
pub async fn listing_detail_view(
    conn: &mut SqliteConnection,
    viewer_id: Option<i64>,
    listing_id: i64,
) -> Result<ListingDetailResponse, ApiError> {
    let listing = get_listing(&mut *conn, listing_id).await?;

    let accepted_request = sqlx::query_as::<_, BookingRequest>(
        "SELECT * FROM booking_requests WHERE listing_id = ? AND status = 'accepted'",
    )
    .bind(listing.id)
    .fetch_optional(&mut *conn)
    .await?;

    if listing.is_archived {
        let Some(viewer_id) = viewer_id else {
            return Err(ApiError::NotFound("Listing not found".to_string()));
        };
        let role = resolve_role(&mut *conn, viewer_id, &listing).await?;
        let is_booked_dj = accepted_request
            .as_ref()
            .map(|req| req.requester_id == viewer_id)
            .unwrap_or(false);
        if role != Role::Owner && !is_booked_dj {
            return Err(ApiError::NotFound("Listing not found".to_string()));
        }
    }

    let mut booking_requests = Vec::new();
    let mut current_request = None;

    if let Some(viewer_id) = viewer_id {
        mark_listing_notifications_read(&mut *conn, listing.id, viewer_id).await?;

        match resolve_role(&mut *conn, viewer_id, &listing).await? {
            Role::Owner => {
                // Once archived, only the accepted request is shown
                let mut query = String::from(
                    "SELECT * FROM booking_requests WHERE listing_id = ?",
                );
                if listing.is_archived {
                    query.push_str(" AND status = 'accepted'");
                }
                query.push_str(" ORDER BY created_at DESC, id DESC");

                booking_requests = sqlx::query_as::<_, BookingRequest>(&query)
                    .bind(listing.id)
                    .fetch_all(&mut *conn)
                    .await?;
            }
            Role::Requester | Role::Unrelated => {
                if listing.is_archived {
                    current_request = accepted_request.clone();
                } else {
                    current_request = sqlx::query_as::<_, BookingRequest>(
                        "SELECT * FROM booking_requests WHERE listing_id = ? AND requester_id = ?",
                    )
                    .bind(listing.id)
                    .bind(viewer_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                }
            }
        }
    }

    Ok(ListingDetailResponse {
        listing,
        booking_requests,
        current_request,
        accepted_request,
    })
}

pub async fn listing_detail(
    State(pool): State<DbPool>,
    headers: HeaderMap,
    Path(listing_id): Path<i64>,
) -> Result<Json<ListingDetailResponse>, ApiError> {
    // Auth is optional here, so the token is read directly instead of
    // going through the middleware.
    let viewer_id = match headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
    {
        Some(token) => get_user_id_from_token(&pool, token).await.ok(),
        None => None,
    };

    let mut conn = pool.acquire().await?;
    let detail = listing_detail_view(&mut conn, viewer_id, listing_id).await?;
    Ok(Json(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::{create_booking_request, get_booking, respond_to_booking};
    use crate::db::{begin_immediate, seed_listing, seed_user, test_pool, DbPool};
    use crate::models::{BookingDecision, BookingStatus};
    use crate::notifications::{unread_counts_by_listing, NotificationRole};

    async fn request(pool: &DbPool, listing_id: i64, requester_id: i64) -> i64 {
        let mut tx = begin_immediate(pool).await.unwrap();
        let listing = get_listing(&mut tx, listing_id).await.unwrap();
        let owner = listing_owner_user_id(&mut tx, &listing).await.unwrap();
        let booking = create_booking_request(&mut tx, &listing, owner, requester_id, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        booking.id
    }

    async fn accept(pool: &DbPool, booking_id: i64) {
        let mut tx = begin_immediate(pool).await.unwrap();
        let booking = get_booking(&mut tx, booking_id).await.unwrap();
        let listing = get_listing(&mut tx, booking.listing_id).await.unwrap();
        let owner = listing_owner_user_id(&mut tx, &listing).await.unwrap();
        respond_to_booking(&mut tx, &booking, &listing, owner, owner, BookingDecision::Accept)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn anonymous_viewer_sees_open_listing_without_requests() {
        let pool = test_pool().await;
        let owner = seed_user(&pool, "planner").await;
        let dj = seed_user(&pool, "dj").await;
        let listing = seed_listing(&pool, owner, "Block party").await;
        request(&pool, listing, dj).await;

        let mut conn = pool.acquire().await.unwrap();
        let detail = listing_detail_view(&mut conn, None, listing).await.unwrap();
        assert_eq!(detail.listing.id, listing);
        assert!(detail.booking_requests.is_empty());
        assert!(detail.current_request.is_none());
    }

    #[tokio::test]
    async fn owner_sees_pending_requests_before_archival() {
        let pool = test_pool().await;
        let owner = seed_user(&pool, "planner").await;
        let dj1 = seed_user(&pool, "dj1").await;
        let dj2 = seed_user(&pool, "dj2").await;
        let listing = seed_listing(&pool, owner, "Block party").await;
        request(&pool, listing, dj1).await;
        request(&pool, listing, dj2).await;

        let mut conn = pool.acquire().await.unwrap();
        let detail = listing_detail_view(&mut conn, Some(owner), listing).await.unwrap();
        assert_eq!(detail.booking_requests.len(), 2);
        assert!(detail
            .booking_requests
            .iter()
            .all(|b| b.status == BookingStatus::Pending));
    }

    #[tokio::test]
    async fn archived_listing_hidden_from_anonymous_and_unrelated() {
        let pool = test_pool().await;
        let owner = seed_user(&pool, "planner").await;
        let dj = seed_user(&pool, "dj").await;
        let stranger = seed_user(&pool, "stranger").await;
        let listing = seed_listing(&pool, owner, "Block party").await;
        let booking = request(&pool, listing, dj).await;
        accept(&pool, booking).await;

        let mut conn = pool.acquire().await.unwrap();
        let err = listing_detail_view(&mut conn, None, listing).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = listing_detail_view(&mut conn, Some(stranger), listing)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn archived_listing_visible_to_owner_and_booked_dj() {
        let pool = test_pool().await;
        let owner = seed_user(&pool, "planner").await;
        let dj1 = seed_user(&pool, "dj1").await;
        let dj2 = seed_user(&pool, "dj2").await;
        let listing = seed_listing(&pool, owner, "Block party").await;
        let winner = request(&pool, listing, dj1).await;
        request(&pool, listing, dj2).await;
        accept(&pool, winner).await;

        let mut conn = pool.acquire().await.unwrap();

        // owner still sees the listing, but only the accepted request
        let detail = listing_detail_view(&mut conn, Some(owner), listing).await.unwrap();
        assert!(detail.listing.is_archived);
        assert_eq!(detail.booking_requests.len(), 1);
        assert_eq!(detail.booking_requests[0].status, BookingStatus::Accepted);

        // the booked dj sees it too, with the accepted request as theirs
        let detail = listing_detail_view(&mut conn, Some(dj1), listing).await.unwrap();
        let current = detail.current_request.expect("booked dj sees the accepted request");
        assert_eq!(current.requester_id, dj1);
        assert_eq!(current.status, BookingStatus::Accepted);

        // the auto-declined dj is not carved out
        let err = listing_detail_view(&mut conn, Some(dj2), listing).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn viewing_marks_the_viewers_notifications_read() {
        let pool = test_pool().await;
        let owner = seed_user(&pool, "planner").await;
        let dj = seed_user(&pool, "dj").await;
        let listing = seed_listing(&pool, owner, "Block party").await;
        request(&pool, listing, dj).await;

        let mut conn = pool.acquire().await.unwrap();
        let before = unread_counts_by_listing(&mut conn, owner, NotificationRole::Owner)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].unread_count, 1);

        listing_detail_view(&mut conn, Some(owner), listing).await.unwrap();

        let after = unread_counts_by_listing(&mut conn, owner, NotificationRole::Owner)
            .await
            .unwrap();
        assert!(after.is_empty());
    }
}
