//! Core listing aggregate, moderation verdict and error taxonomy for REMM.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "remm-core";

/// Substituted when the classifier rejects content without remediation hints.
pub const DEFAULT_SUGGESTION: &str =
    "Please review the content and ensure it follows our guidelines.";

/// Used when the classifier rejects content without saying why.
pub const DEFAULT_REJECTION_REASON: &str = "Content does not meet the listing guidelines.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub Uuid);

impl ListingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ListingId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Who is asking for a moderation check.
///
/// `System` is the trusted background path and bypasses ownership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    System,
    User(UserId),
}

impl Caller {
    pub fn from_identity(identity: Option<UserId>) -> Self {
        match identity {
            Some(user_id) => Self::User(user_id),
            None => Self::System,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::System => None,
            Self::User(user_id) => Some(*user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Published,
    Archived,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown listing status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for ListingStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Approve/reject verdict returned by the classifier. Not persisted as-is;
/// its fields are projected onto [`Listing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub is_approved: bool,
    pub rejection_reason: Option<String>,
    pub suggestions: Option<Vec<String>>,
}

impl ModerationResult {
    pub fn approved() -> Self {
        Self {
            is_approved: true,
            rejection_reason: None,
            suggestions: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::from_verdict(false, Some(reason.into()), None)
    }

    /// Normalizes a raw verdict: approvals carry no reason or suggestions,
    /// rejections always carry a reason and at least one suggestion.
    pub fn from_verdict(
        approved: bool,
        reason: Option<String>,
        suggestions: Option<Vec<String>>,
    ) -> Self {
        if approved {
            return Self::approved();
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string());
        let suggestions = suggestions
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let suggestions = if suggestions.is_empty() {
            vec![DEFAULT_SUGGESTION.to_string()]
        } else {
            suggestions
        };

        Self {
            is_approved: false,
            rejection_reason: Some(reason),
            suggestions: Some(suggestions),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot move listing from {from} to {to}")]
    InvalidTransition {
        from: ListingStatus,
        to: ListingStatus,
    },
    #[error("listing is awaiting moderation")]
    ModerationPending,
    #[error("listing was rejected by moderation: {}", reason.as_deref().unwrap_or("no reason given"))]
    ModerationRejected { reason: Option<String> },
    #[error("listing was unpublished by an administrator: {reason}")]
    AdminRestricted { reason: String },
    #[error("listing has been deleted")]
    Deleted,
}

/// Property listing aggregate.
///
/// Transitions are copy-on-write: each returns a new `Listing` and leaves the
/// receiver untouched, so a failed transition never leaves a half-applied value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub owner_id: UserId,
    pub title: String,
    pub description: String,
    pub status: ListingStatus,
    pub is_moderation_approved: Option<bool>,
    pub moderation_checked_at: Option<DateTime<Utc>>,
    pub moderation_rejection_reason: Option<String>,
    pub admin_unpublished_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Outcome of [`Listing::edit_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEdit {
    pub listing: Listing,
    pub title_changed: bool,
    pub description_changed: bool,
}

impl ContentEdit {
    pub fn content_changed(&self) -> bool {
        self.title_changed || self.description_changed
    }
}

impl Listing {
    pub fn new(
        owner_id: UserId,
        title: impl Into<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ListingId::new(),
            owner_id,
            title: title.into(),
            description: description.into(),
            status: ListingStatus::Draft,
            is_moderation_approved: None,
            moderation_checked_at: None,
            moderation_rejection_reason: None,
            admin_unpublished_reason: None,
            created_at: now,
            updated_at: now,
            published_at: None,
            archived_at: None,
            deleted_at: None,
        }
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_pending_moderation(&self) -> bool {
        self.is_moderation_approved.is_none()
    }

    pub fn is_publicly_visible(&self) -> bool {
        self.status == ListingStatus::Published && !self.is_deleted()
    }

    /// Projects a verdict onto the moderation fields. Status is left alone.
    pub fn set_moderation_result(
        &self,
        approved: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Listing {
        let mut next = self.clone();
        next.is_moderation_approved = Some(approved);
        next.moderation_rejection_reason = if approved {
            None
        } else {
            reason.map(ToString::to_string)
        };
        next.moderation_checked_at = Some(now);
        next
    }

    pub fn apply_moderation(&self, result: &ModerationResult, now: DateTime<Utc>) -> Listing {
        self.set_moderation_result(result.is_approved, result.rejection_reason.as_deref(), now)
    }

    /// Applies a title/description edit. Any real change drops a published
    /// listing back to draft and resets moderation to pending.
    pub fn edit_content(
        &self,
        title: Option<&str>,
        description: Option<&str>,
        now: DateTime<Utc>,
    ) -> ContentEdit {
        let title_changed = title.is_some_and(|t| t != self.title);
        let description_changed = description.is_some_and(|d| d != self.description);

        let mut next = self.clone();
        if title_changed || description_changed {
            if let Some(title) = title {
                next.title = title.to_string();
            }
            if let Some(description) = description {
                next.description = description.to_string();
            }
            next.updated_at = now;
            next.is_moderation_approved = None;
            next.moderation_checked_at = None;
            next.moderation_rejection_reason = None;
            if next.status == ListingStatus::Published {
                next.status = ListingStatus::Draft;
                next.published_at = None;
            }
        }

        ContentEdit {
            listing: next,
            title_changed,
            description_changed,
        }
    }

    pub fn publish(&self, now: DateTime<Utc>) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        if self.status != ListingStatus::Draft {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: ListingStatus::Published,
            });
        }
        if let Some(reason) = &self.admin_unpublished_reason {
            return Err(TransitionError::AdminRestricted {
                reason: reason.clone(),
            });
        }
        match self.is_moderation_approved {
            Some(true) => {}
            Some(false) => {
                return Err(TransitionError::ModerationRejected {
                    reason: self.moderation_rejection_reason.clone(),
                })
            }
            None => return Err(TransitionError::ModerationPending),
        }

        let mut next = self.clone();
        next.status = ListingStatus::Published;
        next.published_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    pub fn unpublish(&self, now: DateTime<Utc>) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        if self.status != ListingStatus::Published {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: ListingStatus::Draft,
            });
        }
        let mut next = self.clone();
        next.status = ListingStatus::Draft;
        next.published_at = None;
        next.updated_at = now;
        Ok(next)
    }

    /// Moves a published listing back to draft and blocks re-publication
    /// until [`Listing::clear_admin_restriction`] is called.
    pub fn admin_unpublish(
        &self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        let mut next = self.clone();
        if next.status == ListingStatus::Published {
            next.status = ListingStatus::Draft;
            next.published_at = None;
        }
        next.admin_unpublished_reason = Some(reason.into());
        next.updated_at = now;
        Ok(next)
    }

    pub fn clear_admin_restriction(&self, now: DateTime<Utc>) -> Listing {
        let mut next = self.clone();
        if next.admin_unpublished_reason.take().is_some() {
            next.updated_at = now;
        }
        next
    }

    pub fn archive(&self, now: DateTime<Utc>) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        if self.status == ListingStatus::Archived {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: ListingStatus::Archived,
            });
        }
        let mut next = self.clone();
        next.status = ListingStatus::Archived;
        next.archived_at = Some(now);
        next.published_at = None;
        next.updated_at = now;
        Ok(next)
    }

    pub fn unarchive(&self, now: DateTime<Utc>) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        if self.status != ListingStatus::Archived {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: ListingStatus::Draft,
            });
        }
        let mut next = self.clone();
        next.status = ListingStatus::Draft;
        next.archived_at = None;
        next.updated_at = now;
        Ok(next)
    }

    pub fn soft_delete(&self, now: DateTime<Utc>) -> Result<Listing, TransitionError> {
        self.ensure_not_deleted()?;
        let mut next = self.clone();
        next.deleted_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    fn ensure_not_deleted(&self) -> Result<(), TransitionError> {
        if self.is_deleted() {
            Err(TransitionError::Deleted)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationErrorKind {
    NotFound,
    Forbidden,
    ClassificationTransport,
    ClassificationParse,
    Storage,
}

impl ModerationErrorKind {
    pub fn default_retryable(self) -> bool {
        match self {
            Self::NotFound | Self::Forbidden => false,
            Self::ClassificationTransport | Self::ClassificationParse | Self::Storage => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::ClassificationTransport => "classification_transport",
            Self::ClassificationParse => "classification_parse",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ModerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a moderation check. `retryable` is decided by the layer that
/// raises the error and is the only thing the background runner looks at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ModerationError {
    pub kind: ModerationErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ModerationError {
    pub fn new(kind: ModerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn not_found(listing_id: ListingId) -> Self {
        Self::new(
            ModerationErrorKind::NotFound,
            format!("listing {listing_id} not found"),
        )
    }

    pub fn forbidden(user_id: UserId, listing_id: ListingId) -> Self {
        Self::new(
            ModerationErrorKind::Forbidden,
            format!("user {user_id} does not own listing {listing_id}"),
        )
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ModerationErrorKind::ClassificationTransport, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ModerationErrorKind::ClassificationParse, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ModerationErrorKind::Storage, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Port for anything that can judge a title/description pair.
#[async_trait]
pub trait ContentModerator: Send + Sync {
    async fn check_content(
        &self,
        title: &str,
        description: &str,
    ) -> Result<ModerationResult, ModerationError>;
}
