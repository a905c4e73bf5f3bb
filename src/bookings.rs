use crate::conversations::{get_conversation, get_or_create_conversation, post_message};
use crate::db::{begin_immediate, DbPool};
use crate::error::ApiError;
use crate::listings::{get_listing, listing_owner_user_id};
use crate::models::{
    BookingDecision, BookingRequest, BookingStatus, CreateBookingRequest, Listing,
    RespondBookingRequest,
};
use crate::notifications::notify;
use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};

pub async fn get_booking(
    conn: &mut SqliteConnection,
    booking_id: i64,
) -> Result<BookingRequest, ApiError> {
    sqlx::query_as::<_, BookingRequest>("SELECT * FROM booking_requests WHERE id = ?")
        .bind(booking_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ApiError::NotFound("Booking request not found".to_string()))
}

/// Creates a pending booking request from `requester_id` on the listing.
/// Obtains the owner conversation, optionally posts an opening message,
/// and always notifies the owner. Runs inside the caller's transaction so
/// a failure leaves nothing behind.
pub async fn create_booking_request(
    conn: &mut SqliteConnection,
    listing: &Listing,
    owner_user_id: i64,
    requester_id: i64,
    initial_body: Option<&str>,
) -> Result<BookingRequest, ApiError> {
    if requester_id == owner_user_id {
        return Err(ApiError::Forbidden(
            "You cannot request your own listing".to_string(),
        ));
    }
    if listing.is_archived {
        return Err(ApiError::Conflict(
            "Listing is no longer accepting requests".to_string(),
        ));
    }

    let existing =
        sqlx::query("SELECT 1 FROM booking_requests WHERE listing_id = ? AND requester_id = ?")
            .bind(listing.id)
            .bind(requester_id)
            .fetch_optional(&mut *conn)
            .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "You have already requested this listing".to_string(),
        ));
    }

    let convo = get_or_create_conversation(&mut *conn, owner_user_id, requester_id).await?;

    if let Some(body) = initial_body {
        post_message(&mut *conn, &convo, requester_id, body).await?;
    }

    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO booking_requests (listing_id, requester_id, conversation_id, status, created_at) VALUES (?, ?, ?, 'pending', ?)",
    )
    .bind(listing.id)
    .bind(requester_id)
    .bind(convo.id)
    .bind(now)
    .execute(&mut *conn)
    .await;

    let booking_id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // lost a race against our own duplicate
            return Err(ApiError::Conflict(
                "You have already requested this listing".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    notify(
        &mut *conn,
        owner_user_id,
        listing.id,
        &format!("New booking request for \"{}\"", listing.title),
    )
    .await?;

    tracing::info!(
        listing_id = listing.id,
        requester_id,
        "booking request created"
    );

    Ok(BookingRequest {
        id: booking_id,
        listing_id: listing.id,
        requester_id,
        conversation_id: convo.id,
        status: BookingStatus::Pending,
        created_at: now,
    })
}

/// Applies the owner's accept/decline decision. The status update is
/// guarded on the request still being pending, so a concurrent responder
/// losing the race observes Conflict rather than double-applying.
///
/// Accepting archives the listing, auto-declines every other pending
/// request on it (notification only, no conversation reply for those),
/// posts a reply to the accepted requester's conversation, and notifies
/// them. All of it happens in the caller's transaction.
pub async fn respond_to_booking(
    conn: &mut SqliteConnection,
    booking: &BookingRequest,
    listing: &Listing,
    owner_user_id: i64,
    actor_id: i64,
    decision: BookingDecision,
) -> Result<BookingRequest, ApiError> {
    if actor_id != owner_user_id {
        return Err(ApiError::Forbidden(
            "Only the listing owner can respond to booking requests".to_string(),
        ));
    }

    let new_status = match decision {
        BookingDecision::Accept => BookingStatus::Accepted,
        BookingDecision::Decline => BookingStatus::Declined,
    };

    let updated = sqlx::query(
        "UPDATE booking_requests SET status = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(new_status)
    .bind(booking.id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::Conflict(
            "Booking request already handled".to_string(),
        ));
    }

    let convo = get_conversation(&mut *conn, booking.conversation_id).await?;

    match decision {
        BookingDecision::Decline => {
            post_message(
                &mut *conn,
                &convo,
                owner_user_id,
                &format!("Your request for \"{}\" was declined.", listing.title),
            )
            .await?;
        }
        BookingDecision::Accept => {
            sqlx::query("UPDATE listings SET is_archived = TRUE WHERE id = ?")
                .bind(listing.id)
                .execute(&mut *conn)
                .await?;

            // Competing pending requests lose automatically. They get a
            // notification but no conversation reply.
            let losers = sqlx::query(
                "SELECT requester_id FROM booking_requests WHERE listing_id = ? AND status = 'pending'",
            )
            .bind(listing.id)
            .fetch_all(&mut *conn)
            .await?;

            sqlx::query(
                "UPDATE booking_requests SET status = 'declined' WHERE listing_id = ? AND status = 'pending'",
            )
            .bind(listing.id)
            .execute(&mut *conn)
            .await?;

            for row in &losers {
                let loser_id: i64 = row.get("requester_id");
                notify(
                    &mut *conn,
                    loser_id,
                    listing.id,
                    &format!("Your booking request for \"{}\" was declined", listing.title),
                )
                .await?;
            }

            post_message(
                &mut *conn,
                &convo,
                owner_user_id,
                &format!("Your request for \"{}\" was accepted.", listing.title),
            )
            .await?;

            notify(
                &mut *conn,
                booking.requester_id,
                listing.id,
                &format!("Your booking request for \"{}\" was accepted", listing.title),
            )
            .await?;
        }
    }

    tracing::info!(
        booking_id = booking.id,
        listing_id = listing.id,
        status = ?new_status,
        "booking request resolved"
    );

    Ok(BookingRequest {
        status: new_status,
        ..booking.clone()
    })
}

// --- Handlers ---

pub async fn request_booking(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Path(listing_id): Path<i64>,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<Json<BookingRequest>, ApiError> {
    let mut tx = begin_immediate(&pool).await?;
    let listing = get_listing(&mut tx, listing_id).await?;
    let owner_user_id = listing_owner_user_id(&mut tx, &listing).await?;
    let booking = create_booking_request(
        &mut tx,
        &listing,
        owner_user_id,
        user_id,
        payload.body.as_deref(),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(booking))
}

pub async fn respond_booking(
    State(pool): State<DbPool>,
    Extension(user_id): Extension<i64>,
    Path(booking_id): Path<i64>,
    Json(payload): Json<RespondBookingRequest>,
) -> Result<Json<BookingRequest>, ApiError> {
    let mut tx = begin_immediate(&pool).await?;
    let booking = get_booking(&mut tx, booking_id).await?;
    let listing = get_listing(&mut tx, booking.listing_id).await?;
    let owner_user_id = listing_owner_user_id(&mut tx, &listing).await?;
    let updated = respond_to_booking(
        &mut tx,
        &booking,
        &listing,
        owner_user_id,
        user_id,
        payload.decision,
    )
    .await?;
    tx.commit().await?;

    Ok(Json(updated))
}
