use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

pub type DbPool = Arc<SqlitePool>;

/// Write transactions take sqlite's write lock at BEGIN. A deferred
/// read-then-write pair that overlaps deadlocks into SQLITE_BUSY at
/// commit; with IMMEDIATE the loser waits at BEGIN and re-reads state the
/// winner already committed, so status guards see the final state.
pub async fn begin_immediate(pool: &DbPool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

pub async fn init_db() -> Result<DbPool, sqlx::Error> {
    // Use file-based SQLite for persistence across restarts
    let database_url = if std::path::Path::new("/data").exists() {
        // Production: use /data mounted volume with create_if_missing option
        "sqlite:/data/gigmatch.db?mode=rwc"
    } else {
        // Local dev: use ./data directory
        std::fs::create_dir_all("./data").ok();
        "sqlite:./data/gigmatch.db?mode=rwc"
    };

    tracing::info!("Connecting to database: {}", database_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    create_schema(&pool).await?;

    Ok(Arc::new(pool))
}

async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            token TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            profile_type TEXT NOT NULL DEFAULT 'dj',
            city TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            city TEXT,
            description TEXT,
            is_archived BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (profile_id) REFERENCES profiles(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pair stored canonically (user1_id < user2_id); the unique constraint
    // enforces one conversation per pair regardless of who starts it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user1_id INTEGER NOT NULL,
            user2_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_message_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user1_id) REFERENCES users(id),
            FOREIGN KEY (user2_id) REFERENCES users(id),
            UNIQUE (user1_id, user2_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            sender_id INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            read_by_user1 BOOLEAN NOT NULL DEFAULT FALSE,
            read_by_user2 BOOLEAN NOT NULL DEFAULT FALSE,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id),
            FOREIGN KEY (sender_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One request per (listing, requester) ever; a declined request still
    // blocks re-requesting.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS booking_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listing_id INTEGER NOT NULL,
            requester_id INTEGER NOT NULL,
            conversation_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (listing_id) REFERENCES listings(id),
            FOREIGN KEY (requester_id) REFERENCES users(id),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id),
            UNIQUE (listing_id, requester_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listing_notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listing_id INTEGER NOT NULL,
            recipient_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            is_read BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (listing_id) REFERENCES listings(id),
            FOREIGN KEY (recipient_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot lookup paths
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_profiles_user ON profiles(user_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_profile ON listings(profile_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_listing ON booking_requests(listing_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_requester ON booking_requests(requester_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON listing_notifications(recipient_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notifications_listing ON listing_notifications(listing_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> DbPool {
    // Single connection so the in-memory database is shared across queries
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");

    create_schema(&pool).await.expect("failed to create schema");

    Arc::new(pool)
}

// File-backed pool for tests that need genuinely concurrent connections;
// an in-memory database cannot be shared across more than one.
#[cfg(test)]
pub async fn test_file_pool(tag: &str) -> (DbPool, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!("gigmatch-test-{}-{}.db", tag, std::process::id()));
    let _ = std::fs::remove_file(&path);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .expect("failed to open file-backed test database");

    create_schema(&pool).await.expect("failed to create schema");

    (Arc::new(pool), path)
}

#[cfg(test)]
pub async fn seed_user(pool: &DbPool, username: &str) -> i64 {
    let now = chrono::Utc::now();
    let user_id =
        sqlx::query("INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)")
            .bind(username)
            .bind("test-hash")
            .bind(now)
            .execute(pool.as_ref())
            .await
            .expect("failed to seed user")
            .last_insert_rowid();

    sqlx::query("INSERT INTO profiles (user_id, profile_type, created_at) VALUES (?, 'dj', ?)")
        .bind(user_id)
        .bind(now)
        .execute(pool.as_ref())
        .await
        .expect("failed to seed profile");

    user_id
}

#[cfg(test)]
pub async fn seed_listing(pool: &DbPool, owner_user_id: i64, title: &str) -> i64 {
    use sqlx::Row;

    let profile_id: i64 = sqlx::query("SELECT id FROM profiles WHERE user_id = ?")
        .bind(owner_user_id)
        .fetch_one(pool.as_ref())
        .await
        .expect("owner has no profile")
        .get("id");

    sqlx::query("INSERT INTO listings (profile_id, title, created_at) VALUES (?, ?, ?)")
        .bind(profile_id)
        .bind(title)
        .bind(chrono::Utc::now())
        .execute(pool.as_ref())
        .await
        .expect("failed to seed listing")
        .last_insert_rowid()
}
