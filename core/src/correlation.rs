//! Correlation identifiers and the per-operation context that carries them.
//!
//! A [`CorrelationContext`] is created once per inbound call or consumed
//! message and handed to everything that runs on behalf of that operation.
//! Clones share one slot, so a value set by the inbound adapter is visible to
//! the outbound adapter no matter which worker thread the operation resumes on.
//! Two contexts created for two different inbound calls never share a slot.
//!
//! # Example
//!
//! ```rust
//! use meshguard_core::correlation::{CorrelationContext, CorrelationId};
//!
//! let context = CorrelationContext::new();
//! assert!(context.get().is_none());
//!
//! context.set("order-42").unwrap();
//! let handle = context.clone();
//! assert_eq!(handle.get().map(|id| id.to_string()), Some("order-42".to_string()));
//!
//! assert!(context.set("   ").is_err());
//! ```

use crate::error::CorrelationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// HTTP header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// RPC metadata key carrying the correlation id. Always written lower case.
pub const RPC_CORRELATION_KEY: &str = "x-correlation-id";

/// Message header carrying the correlation id on publish, send and consume.
pub const MESSAGE_CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Opaque identifier of one logical end-to-end operation.
///
/// Always non-empty and never only whitespace. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Validate and wrap an inbound value. The value is kept verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Invalid`] if `value` is empty or whitespace.
    pub fn parse(value: impl AsRef<str>) -> Result<Self, CorrelationError> {
        let value = value.as_ref();
        if value.trim().is_empty() {
            return Err(CorrelationError::Invalid);
        }
        Ok(Self(Arc::from(value)))
    }

    /// Synthesize a fresh id (UUID v4, hyphenated).
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = CorrelationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for CorrelationId {
    type Error = CorrelationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0.to_string()
    }
}

/// Slot holding the correlation id of one logical operation.
///
/// Create one per inbound call or message. Pass clones down the call chain.
#[derive(Debug, Clone, Default)]
pub struct CorrelationContext {
    slot: Arc<RwLock<Option<CorrelationId>>>,
}

impl CorrelationContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context already holding `id`.
    #[must_use]
    pub fn with_id(id: CorrelationId) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(id))),
        }
    }

    /// Create a context holding a freshly generated id.
    #[must_use]
    pub fn generate() -> Self {
        Self::with_id(CorrelationId::generate())
    }

    /// Establish `id` as current for this operation.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Invalid`] if `id` is empty or whitespace.
    /// The previously held value is left untouched in that case.
    pub fn set(&self, id: impl AsRef<str>) -> Result<CorrelationId, CorrelationError> {
        let id = CorrelationId::parse(id)?;
        self.set_id(id.clone());
        Ok(id)
    }

    /// Establish an already validated id as current.
    pub fn set_id(&self, id: CorrelationId) {
        // A writer that panicked cannot leave a half-written Option behind.
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(id);
    }

    /// The id established by the latest `set` on this context or its clones.
    #[must_use]
    pub fn get(&self) -> Option<CorrelationId> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current id, generating and storing one if none was set.
    #[must_use]
    pub fn get_or_generate(&self) -> CorrelationId {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert_with(CorrelationId::generate).clone()
    }
}
