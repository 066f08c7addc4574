//! Resolving a pending registration into a new roster identity.

use crate::extractor::{largest_face, FaceExtractor};
use crate::session::SessionState;
use crate::store::Roster;
use crate::types::{Gallery, IdentityId, NewIdentity};
use serde::Deserialize;

/// Operator-supplied details for the pending face.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationForm {
    pub roll_no: String,
    pub name: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub email: String,
}

impl RegistrationForm {
    fn into_identity(self) -> Result<NewIdentity, String> {
        let roll_no = self.roll_no.trim().to_string();
        let name = self.name.trim().to_string();
        if roll_no.is_empty() {
            return Err("roll number is required".into());
        }
        if name.is_empty() {
            return Err("name is required".into());
        }
        Ok(NewIdentity {
            roll_no,
            name,
            class: self.class.trim().to_string(),
            section: self.section.trim().to_string(),
            email: self.email.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    /// The identity and its embedding were stored. `gallery` is the
    /// reloaded snapshot, or `None` when the reload failed and the operator
    /// has to reload by hand.
    Registered {
        identity_id: IdentityId,
        gallery: Option<Gallery>,
    },
    NothingPending,
    NoFaceInCrop,
    ExtractionFailed(String),
    DuplicateRollNo(String),
    InvalidForm(String),
}

impl RegistrationOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RegistrationOutcome::Registered { .. })
    }

    pub fn message(&self) -> String {
        match self {
            RegistrationOutcome::Registered { identity_id, gallery } => {
                registered_message(*identity_id, gallery.is_some())
            }
            RegistrationOutcome::NothingPending => "No face is waiting for registration.".into(),
            RegistrationOutcome::NoFaceInCrop => {
                "No face could be found in the captured crop; abandon it and capture again.".into()
            }
            RegistrationOutcome::ExtractionFailed(e) => format!("Could not encode the face: {e}"),
            RegistrationOutcome::DuplicateRollNo(roll) => {
                format!("Roll number {roll} is already registered.")
            }
            RegistrationOutcome::InvalidForm(why) => format!("Invalid registration: {why}"),
        }
    }
}

/// Operator message for a stored registration.
pub fn registered_message(identity_id: IdentityId, gallery_reloaded: bool) -> String {
    if gallery_reloaded {
        format!("Registered new student (id {identity_id}).")
    } else {
        format!("Registered new student (id {identity_id}); reload the gallery to recognise them.")
    }
}

/// Register the session's pending face under `form`.
///
/// The embedding is extracted from the crop before anything is written and
/// the roster stores identity and embedding together, so a failure never
/// leaves a student without a face. Until the roster write succeeds the
/// pending registration is kept and the same form can be retried.
pub async fn register_pending_face<E, R>(
    extractor: &mut E,
    roster: &R,
    session: &mut SessionState,
    form: RegistrationForm,
) -> Result<RegistrationOutcome, R::Error>
where
    E: FaceExtractor,
    R: Roster,
{
    let Some(pending) = session.pending() else {
        return Ok(RegistrationOutcome::NothingPending);
    };
    let identity = match form.into_identity() {
        Ok(identity) => identity,
        Err(why) => return Ok(RegistrationOutcome::InvalidForm(why)),
    };

    let faces = match extractor.detect_faces(&pending.crop) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(capture_id = %pending.capture_id, error = %e, "registration: extraction failed");
            return Ok(RegistrationOutcome::ExtractionFailed(e.to_string()));
        }
    };
    let Some(face) = largest_face(&faces) else {
        tracing::warn!(capture_id = %pending.capture_id, "registration: no face in crop");
        return Ok(RegistrationOutcome::NoFaceInCrop);
    };
    let embedding = face.embedding.clone();

    let roll_no = identity.roll_no.clone();
    let Some(identity_id) = roster.enroll(identity, embedding).await? else {
        tracing::info!(%roll_no, "registration: duplicate roll number");
        return Ok(RegistrationOutcome::DuplicateRollNo(roll_no));
    };
    session.abandon_pending();

    let gallery = match roster.load_gallery().await {
        Ok(gallery) => {
            tracing::info!(identity_id, %roll_no, gallery = gallery.len(), "registration: complete");
            Some(gallery)
        }
        Err(e) => {
            tracing::warn!(identity_id, %roll_no, error = %e, "registration: stored but gallery reload failed");
            None
        }
    };
    Ok(RegistrationOutcome::Registered { identity_id, gallery })
}
