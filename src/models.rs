use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub profile_type: String,
    pub city: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Listing {
    pub id: i64,
    pub profile_id: i64,
    pub title: String,
    pub city: Option<String>,
    pub description: Option<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

/// A 1:1 channel between two users. The pair is stored canonically with
/// `user1_id < user2_id` so the unique constraint covers both argument
/// orders.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Conversation {
    pub id: i64,
    pub user1_id: i64,
    pub user2_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: i64) -> bool {
        user_id == self.user1_id || user_id == self.user2_id
    }

    pub fn other_user_id(&self, me_id: i64) -> i64 {
        if self.user1_id == me_id {
            self.user2_id
        } else {
            self.user1_id
        }
    }
}

/// Read receipts are per participant slot, not per arbitrary user count:
/// conversations are strictly 1:1.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_by_user1: bool,
    pub read_by_user2: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct BookingRequest {
    pub id: i64,
    pub listing_id: i64,
    pub requester_id: i64,
    pub conversation_id: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct ListingNotification {
    pub id: i64,
    pub listing_id: i64,
    pub recipient_id: i64,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// --- Request / response payloads ---

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAccountResponse {
    pub token: String,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateListingRequest {
    pub title: String,
    pub city: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartConversationRequest {
    pub recipient_id: i64,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CreateBookingRequest {
    /// Optional opening message posted into the owner conversation.
    pub body: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookingDecision {
    Accept,
    Decline,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RespondBookingRequest {
    pub decision: BookingDecision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    pub other_user_id: i64,
    pub other_username: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListingDetailResponse {
    pub listing: Listing,
    /// Owner view: requests on the listing (accepted only once archived).
    pub booking_requests: Vec<BookingRequest>,
    /// Non-owner view: the viewer's own request, if any.
    pub current_request: Option<BookingRequest>,
    pub accepted_request: Option<BookingRequest>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ListingUnreadCount {
    pub listing_id: i64,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
