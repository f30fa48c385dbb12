//! Listing persistence: repository port, in-memory store and Postgres adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remm_core::{Listing, ListingId, ListingStatus, ModerationError, ModerationResult, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "remm-storage";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("listing {0} already exists")]
    Conflict(ListingId),
    #[error("listing {0} not found")]
    Missing(ListingId),
    #[error("corrupt listing row: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StorageError> for ModerationError {
    fn from(err: StorageError) -> Self {
        match err {
            // The row vanished between load and save; waiting will not bring it back.
            StorageError::Missing(id) => ModerationError::not_found(id),
            StorageError::Corrupt(msg) => ModerationError::storage(msg).with_retryable(false),
            other => ModerationError::storage(other.to_string()),
        }
    }
}

/// A verdict to store, together with the content it was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationUpdate {
    pub listing_id: ListingId,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
}

impl ModerationUpdate {
    pub fn for_listing(listing: &Listing, result: &ModerationResult, checked_at: DateTime<Utc>) -> Self {
        Self {
            listing_id: listing.id,
            approved: result.is_approved,
            rejection_reason: if result.is_approved {
                None
            } else {
                result.rejection_reason.clone()
            },
            checked_at,
            title: listing.title.clone(),
            description: listing.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationWrite {
    Applied,
    /// Title or description changed since classification; nothing was written.
    Stale,
}

/// Listing persistence port. Soft-deleted listings read as absent.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn get_by_id(&self, id: ListingId) -> Result<Option<Listing>, StorageError>;
    async fn insert(&self, listing: &Listing) -> Result<(), StorageError>;
    async fn update(&self, listing: &Listing) -> Result<(), StorageError>;
    /// Writes only the moderation columns and `updated_at`, and only while the
    /// stored title and description still match the classified content.
    async fn set_moderation(&self, update: &ModerationUpdate) -> Result<ModerationWrite, StorageError>;
}

/// Produces an isolated repository handle. Background attempts open one each.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn ListingRepository>, StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryListingStore {
    listings: Arc<RwLock<HashMap<ListingId, Listing>>>,
    sessions_opened: Arc<AtomicUsize>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> InMemoryListingRepository {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        InMemoryListingRepository {
            listings: Arc::clone(&self.listings),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Raw row lookup that also sees soft-deleted listings.
    pub async fn peek(&self, id: ListingId) -> Option<Listing> {
        self.listings.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listings.read().await.is_empty()
    }
}

#[async_trait]
impl SessionFactory for InMemoryListingStore {
    async fn open_session(&self) -> Result<Box<dyn ListingRepository>, StorageError> {
        Ok(Box::new(self.session()))
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryListingRepository {
    listings: Arc<RwLock<HashMap<ListingId, Listing>>>,
    session_id: Uuid,
}

impl InMemoryListingRepository {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[async_trait]
impl ListingRepository for InMemoryListingRepository {
    async fn get_by_id(&self, id: ListingId) -> Result<Option<Listing>, StorageError> {
        let map = self.listings.read().await;
        Ok(map.get(&id).filter(|l| !l.is_deleted()).cloned())
    }

    async fn insert(&self, listing: &Listing) -> Result<(), StorageError> {
        let mut map = self.listings.write().await;
        if map.contains_key(&listing.id) {
            return Err(StorageError::Conflict(listing.id));
        }
        map.insert(listing.id, listing.clone());
        debug!(session_id = %self.session_id, listing_id = %listing.id, "inserted listing");
        Ok(())
    }

    async fn update(&self, listing: &Listing) -> Result<(), StorageError> {
        let mut map = self.listings.write().await;
        match map.get_mut(&listing.id) {
            Some(existing) if !existing.is_deleted() => {
                *existing = listing.clone();
                debug!(session_id = %self.session_id, listing_id = %listing.id, "updated listing");
                Ok(())
            }
            _ => Err(StorageError::Missing(listing.id)),
        }
    }

    async fn set_moderation(&self, update: &ModerationUpdate) -> Result<ModerationWrite, StorageError> {
        let mut map = self.listings.write().await;
        let Some(existing) = map.get_mut(&update.listing_id).filter(|l| !l.is_deleted()) else {
            return Err(StorageError::Missing(update.listing_id));
        };
        if existing.title != update.title || existing.description != update.description {
            return Ok(ModerationWrite::Stale);
        }
        let mut next = existing.set_moderation_result(
            update.approved,
            update.rejection_reason.as_deref(),
            update.checked_at,
        );
        next.updated_at = update.checked_at;
        *existing = next;
        debug!(session_id = %self.session_id, listing_id = %update.listing_id, "stored moderation verdict");
        Ok(ModerationWrite::Applied)
    }
}

pub async fn connect_pg(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running listing migrations")
}

#[derive(Debug, Clone)]
pub struct PgListingRepository {
    pool: PgPool,
}

impl PgListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const LISTING_COLUMNS: &str = "id, owner_id, title, description, status, \
    is_moderation_approved, moderation_checked_at, moderation_rejection_reason, \
    admin_unpublished_reason, created_at, updated_at, published_at, archived_at, deleted_at";

fn decode_error(column: &str, err: sqlx::Error) -> StorageError {
    StorageError::Corrupt(format!("column {column}: {err}"))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(|err| decode_error(name, err))
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StorageError> {
    let status: String = column(row, "status")?;
    let status = status
        .parse::<ListingStatus>()
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
    Ok(Listing {
        id: ListingId(column::<Uuid>(row, "id")?),
        owner_id: UserId(column::<Uuid>(row, "owner_id")?),
        title: column(row, "title")?,
        description: column(row, "description")?,
        status,
        is_moderation_approved: column(row, "is_moderation_approved")?,
        moderation_checked_at: column::<Option<DateTime<Utc>>>(row, "moderation_checked_at")?,
        moderation_rejection_reason: column(row, "moderation_rejection_reason")?,
        admin_unpublished_reason: column(row, "admin_unpublished_reason")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        published_at: column(row, "published_at")?,
        archived_at: column(row, "archived_at")?,
        deleted_at: column(row, "deleted_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[async_trait]
impl ListingRepository for PgListingRepository {
    async fn get_by_id(&self, id: ListingId) -> Result<Option<Listing>, StorageError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn insert(&self, listing: &Listing) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO listings ({LISTING_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );
        let result = sqlx::query(&sql)
            .bind(listing.id.0)
            .bind(listing.owner_id.0)
            .bind(&listing.title)
            .bind(&listing.description)
            .bind(listing.status.as_str())
            .bind(listing.is_moderation_approved)
            .bind(listing.moderation_checked_at)
            .bind(&listing.moderation_rejection_reason)
            .bind(&listing.admin_unpublished_reason)
            .bind(listing.created_at)
            .bind(listing.updated_at)
            .bind(listing.published_at)
            .bind(listing.archived_at)
            .bind(listing.deleted_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::Conflict(listing.id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, listing: &Listing) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET title = $2,
                   description = $3,
                   status = $4,
                   is_moderation_approved = $5,
                   moderation_checked_at = $6,
                   moderation_rejection_reason = $7,
                   admin_unpublished_reason = $8,
                   updated_at = $9,
                   published_at = $10,
                   archived_at = $11,
                   deleted_at = $12
             WHERE id = $1
               AND deleted_at IS NULL
            "#,
        )
        .bind(listing.id.0)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.status.as_str())
        .bind(listing.is_moderation_approved)
        .bind(listing.moderation_checked_at)
        .bind(&listing.moderation_rejection_reason)
        .bind(&listing.admin_unpublished_reason)
        .bind(listing.updated_at)
        .bind(listing.published_at)
        .bind(listing.archived_at)
        .bind(listing.deleted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Missing(listing.id));
        }
        Ok(())
    }

    async fn set_moderation(&self, update: &ModerationUpdate) -> Result<ModerationWrite, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET is_moderation_approved = $2,
                   moderation_rejection_reason = $3,
                   moderation_checked_at = $4,
                   updated_at = $4
             WHERE id = $1
               AND deleted_at IS NULL
               AND title = $5
               AND description = $6
            "#,
        )
        .bind(update.listing_id.0)
        .bind(update.approved)
        .bind(&update.rejection_reason)
        .bind(update.checked_at)
        .bind(&update.title)
        .bind(&update.description)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(ModerationWrite::Applied);
        }

        let live = sqlx::query("SELECT 1 FROM listings WHERE id = $1 AND deleted_at IS NULL")
            .bind(update.listing_id.0)
            .fetch_optional(&self.pool)
            .await?;
        match live {
            Some(_) => Ok(ModerationWrite::Stale),
            None => Err(StorageError::Missing(update.listing_id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
}

impl PgSessionFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn open_session(&self) -> Result<Box<dyn ListingRepository>, StorageError> {
        if self.pool.is_closed() {
            return Err(StorageError::Unavailable("postgres pool is closed".to_string()));
        }
        Ok(Box::new(PgListingRepository::new(self.pool.clone())))
    }
}
