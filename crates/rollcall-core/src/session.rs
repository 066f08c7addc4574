use crate::types::{BoundingBox, IdentityId};
use chrono::{NaiveDate, NaiveDateTime};
use image::GrayImage;
use std::collections::HashSet;
use uuid::Uuid;

/// An unknown live face waiting for an operator decision.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub capture_id: Uuid,
    pub crop: GrayImage,
    /// Box of the face in the decision frame it was cropped from.
    pub bbox: BoundingBox,
    pub detected_at: NaiveDateTime,
}

/// Per-operator camera session state.
///
/// Owned by the caller and passed into every capture cycle. The marked set
/// is a cache in front of the ledger; the pending registration gates
/// further captures until it is resolved.
#[derive(Debug, Default)]
pub struct SessionState {
    marked_today: HashSet<IdentityId>,
    day: Option<NaiveDate>,
    pending: Option<PendingRegistration>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget cached marks when the calendar day changes.
    pub fn roll_over(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            if self.day.is_some() {
                tracing::info!(%today, cleared = self.marked_today.len(), "session: new day, clearing marks");
            }
            self.marked_today.clear();
            self.day = Some(today);
        }
    }

    pub fn is_marked(&self, identity_id: IdentityId) -> bool {
        self.marked_today.contains(&identity_id)
    }

    pub(crate) fn mark(&mut self, identity_id: IdentityId) {
        self.marked_today.insert(identity_id);
    }

    pub fn marked_count(&self) -> usize {
        self.marked_today.len()
    }

    pub fn pending(&self) -> Option<&PendingRegistration> {
        self.pending.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn set_pending(&mut self, pending: PendingRegistration) {
        self.pending = Some(pending);
    }

    /// Drop the pending registration. Returns false if there was none.
    pub fn abandon_pending(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Start a fresh sitting: clears the marked set.
    ///
    /// A pending registration survives; it must be registered or abandoned.
    pub fn reset(&mut self) {
        self.marked_today.clear();
        self.day = None;
    }
}
