//! Moderation orchestration, the background retry runner and the listing
//! service that decides when a check is enqueued.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remm_core::{
    Caller, ContentModerator, Listing, ListingId, ModerationError, ModerationResult,
    TransitionError, UserId,
};
use remm_storage::{
    ListingRepository, ModerationUpdate, ModerationWrite, SessionFactory, StorageError,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "remm-moderation";

/// Runs one moderation check against a repository and a moderator.
/// Does not retry; failures are returned to the caller as-is.
pub struct ModerationOrchestrator<'a> {
    listings: &'a dyn ListingRepository,
    moderator: &'a dyn ContentModerator,
}

impl<'a> ModerationOrchestrator<'a> {
    pub fn new(listings: &'a dyn ListingRepository, moderator: &'a dyn ContentModerator) -> Self {
        Self {
            listings,
            moderator,
        }
    }

    pub fn from_scope(scope: &'a ModerationScope) -> Self {
        Self::new(scope.listings.as_ref(), scope.moderator.as_ref())
    }

    pub async fn check_moderation(
        &self,
        listing_id: ListingId,
        caller: &Caller,
    ) -> Result<ModerationResult, ModerationError> {
        let listing = self
            .listings
            .get_by_id(listing_id)
            .await?
            .ok_or_else(|| ModerationError::not_found(listing_id))?;

        if let Caller::User(user_id) = caller {
            if !listing.is_owned_by(*user_id) {
                warn!(%listing_id, %user_id, "moderation check refused for non-owner");
                return Err(ModerationError::forbidden(*user_id, listing_id));
            }
        }

        let result = self
            .moderator
            .check_content(&listing.title, &listing.description)
            .await?;

        let update = ModerationUpdate::for_listing(&listing, &result, Utc::now());
        match self.listings.set_moderation(&update).await? {
            ModerationWrite::Applied => info!(
                %listing_id,
                approved = result.is_approved,
                reason = result.rejection_reason.as_deref().unwrap_or(""),
                "moderation verdict stored"
            ),
            ModerationWrite::Stale => info!(
                %listing_id,
                approved = result.is_approved,
                "listing content changed during check; verdict discarded"
            ),
        }
        Ok(result)
    }
}

/// Everything one background attempt needs. A new scope is opened per attempt.
pub struct ModerationScope {
    pub listings: Box<dyn ListingRepository>,
    pub moderator: Arc<dyn ContentModerator>,
}

#[async_trait]
pub trait ScopeFactory: Send + Sync {
    async fn open_scope(&self) -> Result<ModerationScope, ModerationError>;
}

/// Opens a fresh repository session for every scope and pairs it with the
/// configured moderator.
pub struct SessionScopeFactory {
    sessions: Arc<dyn SessionFactory>,
    moderator: Arc<dyn ContentModerator>,
}

impl SessionScopeFactory {
    pub fn new(sessions: Arc<dyn SessionFactory>, moderator: Arc<dyn ContentModerator>) -> Self {
        Self {
            sessions,
            moderator,
        }
    }
}

#[async_trait]
impl ScopeFactory for SessionScopeFactory {
    async fn open_scope(&self) -> Result<ModerationScope, ModerationError> {
        let listings = self.sessions.open_session().await?;
        Ok(ModerationScope {
            listings,
            moderator: Arc::clone(&self.moderator),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_in_flight: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_parse("REMM_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            max_in_flight: env_parse("REMM_MAX_IN_FLIGHT").unwrap_or(defaults.max_in_flight),
            backoff: BackoffPolicy {
                max_retries: env_parse("REMM_MAX_RETRIES").unwrap_or(defaults.backoff.max_retries),
                base_delay: env_parse("REMM_BACKOFF_BASE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.backoff.base_delay),
                max_delay: defaults.backoff.max_delay,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Retry context carried by a background check. Never persisted.
#[derive(Debug, Clone)]
pub struct ModerationJob {
    pub listing_id: ListingId,
    pub task_id: Uuid,
    pub context: String,
    pub caller: Caller,
    pub enqueued_at: DateTime<Utc>,
}

impl ModerationJob {
    pub fn new(listing_id: ListingId, context: impl Into<String>) -> Self {
        Self {
            listing_id,
            task_id: Uuid::new_v4(),
            context: context.into(),
            caller: Caller::System,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        result: ModerationResult,
        attempts: usize,
    },
    /// Stopped on an error tagged non-retryable.
    Abandoned {
        error: ModerationError,
        attempts: usize,
    },
    Exhausted {
        error: ModerationError,
        attempts: usize,
    },
}

impl JobOutcome {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Completed { attempts, .. }
            | Self::Abandoned { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Runs a job to completion with retries. Errors are logged, never returned.
pub async fn run_moderation_job(
    factory: &dyn ScopeFactory,
    policy: BackoffPolicy,
    job: &ModerationJob,
) -> JobOutcome {
    let span = info_span!(
        "moderation_job",
        listing_id = %job.listing_id,
        task_id = %job.task_id,
        context = %job.context,
    );

    async move {
        let mut attempt = 0usize;
        loop {
            let attempts = attempt + 1;
            match run_attempt(factory, job).await {
                Ok(result) => {
                    let waited_ms = (Utc::now() - job.enqueued_at).num_milliseconds();
                    info!(attempts, waited_ms, approved = result.is_approved, "moderation check completed");
                    return JobOutcome::Completed { result, attempts };
                }
                Err(error) if !error.is_retryable() => {
                    warn!(attempts, kind = %error.kind, error = %error, "moderation check failed permanently");
                    return JobOutcome::Abandoned { error, attempts };
                }
                Err(error) if attempt >= policy.max_retries => {
                    error!(attempts, kind = %error.kind, error = %error, "moderation retries exhausted; listing stays pending");
                    return JobOutcome::Exhausted { error, attempts };
                }
                Err(error) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        kind = %error.kind,
                        error = %error,
                        "moderation check failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn run_attempt(
    factory: &dyn ScopeFactory,
    job: &ModerationJob,
) -> Result<ModerationResult, ModerationError> {
    let scope = factory.open_scope().await?;
    ModerationOrchestrator::from_scope(&scope)
        .check_moderation(job.listing_id, &job.caller)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full and the job was dropped.
    QueueFull,
    Closed,
}

/// Fire-and-forget hand-off of a moderation check. Must not block.
pub trait ModerationEnqueuer: Send + Sync {
    fn enqueue_moderation_check(&self, listing_id: ListingId, context: &str) -> EnqueueOutcome;
}

/// Bounded queue feeding a worker pool of detached retrying jobs.
pub struct BackgroundModerationService {
    sender: RwLock<Option<mpsc::Sender<ModerationJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundModerationService {
    /// Spawns the dispatcher on the current tokio runtime.
    pub fn start(factory: Arc<dyn ScopeFactory>, config: &ModerationConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let limit = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let dispatcher = tokio::spawn(dispatch(rx, factory, config.backoff, limit));
        info!(
            queue_capacity = config.queue_capacity,
            max_in_flight = config.max_in_flight,
            "background moderation started"
        );
        Self {
            sender: RwLock::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn enqueue_job(&self, job: ModerationJob) -> EnqueueOutcome {
        let guard = self.sender.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = guard.as_ref() else {
            warn!(listing_id = %job.listing_id, "moderation queue closed; job dropped");
            return EnqueueOutcome::Closed;
        };

        let listing_id = job.listing_id;
        let task_id = job.task_id;
        match sender.try_send(job) {
            Ok(()) => {
                debug!(%listing_id, %task_id, "moderation check queued");
                EnqueueOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    %listing_id,
                    %task_id,
                    context = %job.context,
                    "moderation queue full; job dropped, listing stays pending"
                );
                EnqueueOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%listing_id, "moderation queue closed; job dropped");
                EnqueueOutcome::Closed
            }
        }
    }

    /// Closes the queue and waits for queued and in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(err) = handle.await {
                error!(error = %err, "moderation dispatcher panicked");
            }
        }
        info!("background moderation stopped");
    }
}

impl ModerationEnqueuer for BackgroundModerationService {
    fn enqueue_moderation_check(&self, listing_id: ListingId, context: &str) -> EnqueueOutcome {
        self.enqueue_job(ModerationJob::new(listing_id, context))
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<ModerationJob>,
    factory: Arc<dyn ScopeFactory>,
    policy: BackoffPolicy,
    limit: Arc<Semaphore>,
) {
    let mut in_flight = JoinSet::new();
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let factory = Arc::clone(&factory);
        in_flight.spawn(async move {
            let _permit = permit;
            run_moderation_job(factory.as_ref(), policy, &job).await
        });
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(err) = joined {
                error!(error = %err, "moderation job panicked");
            }
        }
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "moderation job panicked");
        }
    }
}

#[derive(Debug, Error)]
pub enum ListingServiceError {
    #[error("{0} must not be blank")]
    Validation(&'static str),
    #[error("listing {0} not found")]
    NotFound(ListingId),
    #[error("user {user_id} may not modify listing {listing_id}")]
    Forbidden {
        user_id: UserId,
        listing_id: ListingId,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Moderation(#[from] ModerationError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Listing use cases. Content writes hand a moderation check to the enqueuer.
pub struct ListingService {
    listings: Arc<dyn ListingRepository>,
    moderator: Arc<dyn ContentModerator>,
    enqueuer: Arc<dyn ModerationEnqueuer>,
}

impl ListingService {
    pub fn new(
        listings: Arc<dyn ListingRepository>,
        moderator: Arc<dyn ContentModerator>,
        enqueuer: Arc<dyn ModerationEnqueuer>,
    ) -> Self {
        Self {
            listings,
            moderator,
            enqueuer,
        }
    }

    pub async fn create_listing(
        &self,
        owner_id: UserId,
        input: NewListing,
    ) -> Result<Listing, ListingServiceError> {
        ensure_not_blank("title", &input.title)?;
        ensure_not_blank("description", &input.description)?;

        let listing = Listing::new(owner_id, input.title, input.description, Utc::now());
        self.listings.insert(&listing).await?;
        info!(listing_id = %listing.id, %owner_id, "listing created");

        self.enqueue(listing.id, "create");
        Ok(listing)
    }

    /// Owners and everybody else differ only for listings that are not public.
    pub async fn get_listing(
        &self,
        listing_id: ListingId,
        viewer: Option<UserId>,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load(listing_id).await?;
        let is_owner = viewer.is_some_and(|user_id| listing.is_owned_by(user_id));
        if listing.is_publicly_visible() || is_owner {
            Ok(listing)
        } else {
            Err(ListingServiceError::NotFound(listing_id))
        }
    }

    pub async fn update_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
        update: ListingUpdate,
    ) -> Result<Listing, ListingServiceError> {
        if let Some(title) = &update.title {
            ensure_not_blank("title", title)?;
        }
        if let Some(description) = &update.description {
            ensure_not_blank("description", description)?;
        }

        let listing = self.load_owned(listing_id, user_id).await?;
        let edit = listing.edit_content(
            update.title.as_deref(),
            update.description.as_deref(),
            Utc::now(),
        );
        if !edit.content_changed() {
            debug!(%listing_id, "listing update without content change");
            return Ok(edit.listing);
        }

        self.listings.update(&edit.listing).await?;
        let label = format!(
            "update(title:{},desc:{})",
            edit.title_changed, edit.description_changed
        );
        info!(%listing_id, status = %edit.listing.status, context = %label, "listing content updated");
        self.enqueue(listing_id, &label);
        Ok(edit.listing)
    }

    pub async fn publish_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load_owned(listing_id, user_id).await?;
        self.save(listing.publish(Utc::now())?, "published").await
    }

    pub async fn unpublish_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load_owned(listing_id, user_id).await?;
        self.save(listing.unpublish(Utc::now())?, "unpublished").await
    }

    pub async fn archive_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load_owned(listing_id, user_id).await?;
        self.save(listing.archive(Utc::now())?, "archived").await
    }

    pub async fn unarchive_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load_owned(listing_id, user_id).await?;
        self.save(listing.unarchive(Utc::now())?, "unarchived").await
    }

    pub async fn delete_listing(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<(), ListingServiceError> {
        let listing = self.load_owned(listing_id, user_id).await?;
        self.save(listing.soft_delete(Utc::now())?, "deleted").await?;
        Ok(())
    }

    /// Administrative takedown. No ownership check.
    pub async fn admin_unpublish_listing(
        &self,
        listing_id: ListingId,
        reason: &str,
    ) -> Result<Listing, ListingServiceError> {
        ensure_not_blank("reason", reason)?;
        let listing = self.load(listing_id).await?;
        self.save(listing.admin_unpublish(reason.trim(), Utc::now())?, "admin unpublished")
            .await
    }

    /// Synchronous check on the caller's behalf. Errors are not retried.
    pub async fn recheck_moderation(
        &self,
        listing_id: ListingId,
        caller: Caller,
    ) -> Result<ModerationResult, ListingServiceError> {
        let orchestrator =
            ModerationOrchestrator::new(self.listings.as_ref(), self.moderator.as_ref());
        Ok(orchestrator.check_moderation(listing_id, &caller).await?)
    }

    fn enqueue(&self, listing_id: ListingId, context: &str) {
        let outcome = self.enqueuer.enqueue_moderation_check(listing_id, context);
        if outcome != EnqueueOutcome::Queued {
            warn!(%listing_id, context, ?outcome, "moderation check not queued");
        }
    }

    async fn load(&self, listing_id: ListingId) -> Result<Listing, ListingServiceError> {
        self.listings
            .get_by_id(listing_id)
            .await?
            .ok_or(ListingServiceError::NotFound(listing_id))
    }

    async fn load_owned(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> Result<Listing, ListingServiceError> {
        let listing = self.load(listing_id).await?;
        if !listing.is_owned_by(user_id) {
            return Err(ListingServiceError::Forbidden {
                user_id,
                listing_id,
            });
        }
        Ok(listing)
    }

    async fn save(&self, listing: Listing, action: &str) -> Result<Listing, ListingServiceError> {
        self.listings.update(&listing).await?;
        info!(listing_id = %listing.id, status = %listing.status, "listing {action}");
        Ok(listing)
    }
}

fn ensure_not_blank(field: &'static str, value: &str) -> Result<(), ListingServiceError> {
    if value.trim().is_empty() {
        Err(ListingServiceError::Validation(field))
    } else {
        Ok(())
    }
}
