//! Persistence seams consumed by the decision engine.
//!
//! The daemon implements both traits over SQLite; tests use in-memory
//! doubles.

use crate::types::{Embedding, Gallery, IdentityId, NewAttendance, NewIdentity};
use chrono::NaiveDate;
use std::future::Future;

/// Append-only per-day presence records.
pub trait AttendanceLedger {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether any record exists for `identity_id` on `date`.
    fn has_record(
        &self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    fn append_record(&self, record: NewAttendance) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Registered identities and their embeddings.
pub trait Roster {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Snapshot of every identity that has an embedding.
    fn load_gallery(&self) -> impl Future<Output = Result<Gallery, Self::Error>> + Send;

    /// Create a roster row together with its embedding, all or nothing.
    ///
    /// `Ok(None)` means the roll number is taken and nothing was written.
    /// On any error no row is left behind, so the same form can be retried.
    fn enroll(
        &self,
        identity: NewIdentity,
        embedding: Embedding,
    ) -> impl Future<Output = Result<Option<IdentityId>, Self::Error>> + Send;
}
