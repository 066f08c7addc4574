use chrono::NaiveDate;
use rollcall_core::types::{GalleryEntry, Identity, NewAttendance, NewIdentity};
use rollcall_core::{AttendanceLedger, AttendanceStatus, Embedding, Gallery, IdentityId, Roster};
use rusqlite::{ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_DIM: usize = rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;
const NONCE_LEN: usize = 12;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected 512)")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("no student with id {0}")]
    StudentNotFound(IdentityId),
    #[error("roll number {0} is already registered")]
    DuplicateRollNo(String),
    #[error("student {0} has {1} attendance records; delete them too or keep the student")]
    StudentHasAttendance(IdentityId, u64),
}

/// SQLite-backed roster and attendance ledger.
///
/// Embeddings are AES-256-GCM encrypted before storage. A per-installation
/// 32-byte key lives at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    enc_key: [u8; 32],
}

/// One attendance row joined with its student.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub id: i64,
    pub student_id: IdentityId,
    pub roll_no: String,
    pub name: String,
    pub class: String,
    pub section: String,
    pub date: String,
    pub time: String,
    pub status: String,
    pub marked_by: Option<i64>,
}

/// Report filters; every field is optional and they combine with AND.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportFilter {
    pub student_id: Option<IdentityId>,
    pub roll_no: Option<String>,
    pub class: Option<String>,
    pub section: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub total: u64,
    pub present: u64,
    pub absent: u64,
    /// Present share in percent, rounded to two decimals.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub present: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassCount {
    pub class: String,
    pub section: String,
    pub status: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceReport {
    pub records: Vec<AttendanceRow>,
    pub summary: AttendanceSummary,
    pub daily: Vec<DailyCount>,
    pub by_class: Vec<ClassCount>,
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");

        let enc_key = if in_memory {
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path.parent().unwrap_or(Path::new(".")).join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS students (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     roll_no TEXT NOT NULL UNIQUE,
                     name TEXT NOT NULL,
                     class TEXT NOT NULL DEFAULT '',
                     section TEXT NOT NULL DEFAULT '',
                     email TEXT NOT NULL DEFAULT '',
                     embedding BLOB,
                     model_version TEXT
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     student_id INTEGER NOT NULL REFERENCES students(id),
                     date TEXT NOT NULL,
                     time TEXT NOT NULL,
                     status TEXT NOT NULL,
                     marked_by INTEGER
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_student_date
                     ON attendance(student_id, date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    // ── Students ──────────────────────────────────────────────────────────────

    /// Insert a student. Returns `None` if the roll number already exists.
    pub async fn create_student(&self, student: NewIdentity) -> Result<Option<IdentityId>, StoreError> {
        self.conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO students (roll_no, name, class, section, email)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![student.roll_no, student.name, student.class, student.section, student.email],
                );
                match inserted {
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    Err(e) if is_unique_violation(&e) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert a student and store their embedding in one transaction.
    ///
    /// Returns `None` if the roll number already exists. The embedding is
    /// validated and encrypted before the transaction starts.
    pub async fn enroll_student(
        &self,
        student: NewIdentity,
        embedding: &Embedding,
    ) -> Result<Option<IdentityId>, StoreError> {
        let blob = self.encrypt_embedding(&embedding.values)?;
        let model_version = embedding.model_version.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO students (roll_no, name, class, section, email)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![student.roll_no, student.name, student.class, student.section, student.email],
                );
                let id = match inserted {
                    Ok(_) => tx.last_insert_rowid(),
                    Err(e) if is_unique_violation(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                tx.execute(
                    "UPDATE students SET embedding = ?1, model_version = ?2 WHERE id = ?3",
                    rusqlite::params![blob, model_version, id],
                )?;
                tx.commit()?;
                Ok(Some(id))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Students ordered by roll number, optionally filtered by class and section.
    pub async fn list_students(
        &self,
        class: Option<String>,
        section: Option<String>,
    ) -> Result<Vec<Identity>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, roll_no, name, class, section, email, embedding IS NOT NULL
                     FROM students
                     WHERE (?1 IS NULL OR class = ?1) AND (?2 IS NULL OR section = ?2)
                     ORDER BY roll_no",
                )?;
                let rows = stmt.query_map(rusqlite::params![class, section], |row| {
                    Ok(Identity {
                        id: row.get(0)?,
                        roll_no: row.get(1)?,
                        name: row.get(2)?,
                        class: row.get(3)?,
                        section: row.get(4)?,
                        email: row.get(5)?,
                        has_embedding: row.get(6)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Replace a student's details. Returns false if no such student.
    pub async fn update_student(&self, id: IdentityId, student: NewIdentity) -> Result<bool, StoreError> {
        let roll_no = student.roll_no.clone();
        let updated = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "UPDATE students SET roll_no = ?1, name = ?2, class = ?3, section = ?4, email = ?5
                     WHERE id = ?6",
                    rusqlite::params![student.roll_no, student.name, student.class, student.section, student.email, id],
                );
                match result {
                    Ok(n) => Ok(Some(n > 0)),
                    Err(e) if is_unique_violation(&e) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        updated.ok_or(StoreError::DuplicateRollNo(roll_no))
    }

    /// Delete a student, and their attendance rows when `delete_attendance`.
    ///
    /// Without `delete_attendance` a student who still has attendance rows
    /// is refused rather than leaving orphaned records.
    pub async fn delete_student(&self, id: IdentityId, delete_attendance: bool) -> Result<bool, StoreError> {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let records: u64 =
                    tx.query_row("SELECT COUNT(*) FROM attendance WHERE student_id = ?1", [id], |row| row.get(0))?;
                if records > 0 {
                    if !delete_attendance {
                        return Ok(Err(records));
                    }
                    tx.execute("DELETE FROM attendance WHERE student_id = ?1", [id])?;
                }
                let affected = tx.execute("DELETE FROM students WHERE id = ?1", [id])?;
                tx.commit()?;
                Ok(Ok(affected > 0))
            })
            .await?;
        outcome.map_err(|records| StoreError::StudentHasAttendance(id, records))
    }

    /// Store (or replace) a student's encrypted embedding.
    pub async fn save_student_embedding(&self, id: IdentityId, embedding: &Embedding) -> Result<(), StoreError> {
        let blob = self.encrypt_embedding(&embedding.values)?;
        let model_version = embedding.model_version.clone();
        let affected = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE students SET embedding = ?1, model_version = ?2 WHERE id = ?3",
                    rusqlite::params![blob, model_version, id],
                )?;
                Ok(n)
            })
            .await?;
        if affected == 0 {
            return Err(StoreError::StudentNotFound(id));
        }
        Ok(())
    }

    /// Forget every embedding but keep the students. Returns rows cleared.
    pub async fn clear_embeddings(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let n = conn.execute(
                    "UPDATE students SET embedding = NULL, model_version = NULL WHERE embedding IS NOT NULL",
                    [],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Build a gallery snapshot from every student with an embedding.
    pub async fn gallery(&self) -> Result<Gallery, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(IdentityId, String, Vec<u8>, Option<String>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, embedding, model_version
                     FROM students WHERE embedding IS NOT NULL ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (identity_id, name, blob, model_version) in rows {
            match self.decrypt_embedding(&blob) {
                Ok(values) => entries.push(GalleryEntry {
                    identity_id,
                    name,
                    embedding: Embedding { values, model_version },
                }),
                Err(e) => {
                    tracing::warn!(identity_id, error = %e, "skipping unreadable embedding");
                }
            }
        }
        Ok(Gallery::new(entries))
    }

    /// (students, students with an embedding)
    pub async fn count_students(&self) -> Result<(u64, u64), StoreError> {
        self.conn
            .call(|conn| {
                let counts = conn.query_row(
                    "SELECT COUNT(*), COUNT(embedding) FROM students",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(counts)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Attendance ────────────────────────────────────────────────────────────

    /// Whether any record, of any status, exists for the student on `date`.
    pub async fn has_attendance(&self, id: IdentityId, date: NaiveDate) -> Result<bool, StoreError> {
        let date = date.format(DATE_FMT).to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE student_id = ?1 AND date = ?2",
                    rusqlite::params![id, date],
                    |row| row.get(0),
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append one attendance row. Returns its id.
    pub async fn insert_attendance(&self, record: &NewAttendance) -> Result<i64, StoreError> {
        let NewAttendance {
            identity_id,
            date,
            time,
            status,
            marked_by,
        } = record.clone();
        let date = date.format(DATE_FMT).to_string();
        let time = time.format(TIME_FMT).to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (student_id, date, time, status, marked_by)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![identity_id, date, time, status.as_str(), marked_by],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn update_attendance_status(&self, id: i64, status: AttendanceStatus) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE attendance SET status = ?1 WHERE id = ?2",
                    rusqlite::params![status.as_str(), id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_attendance(&self, id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| Ok(conn.execute("DELETE FROM attendance WHERE id = ?1", [id])? > 0))
            .await
            .map_err(StoreError::from)
    }

    /// Attendance rows matching `filter`, newest first.
    pub async fn attendance_records(&self, filter: ReportFilter) -> Result<Vec<AttendanceRow>, StoreError> {
        let start = filter.start_date.map(|d| d.format(DATE_FMT).to_string());
        let end = filter.end_date.map(|d| d.format(DATE_FMT).to_string());
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.student_id, s.roll_no, s.name, s.class, s.section,
                            a.date, a.time, a.status, a.marked_by
                     FROM attendance a
                     JOIN students s ON s.id = a.student_id
                     WHERE (?1 IS NULL OR a.student_id = ?1)
                       AND (?2 IS NULL OR s.roll_no = ?2)
                       AND (?3 IS NULL OR s.class = ?3)
                       AND (?4 IS NULL OR s.section = ?4)
                       AND (?5 IS NULL OR a.date >= ?5)
                       AND (?6 IS NULL OR a.date <= ?6)
                     ORDER BY a.date DESC, a.time DESC, a.id DESC",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![filter.student_id, filter.roll_no, filter.class, filter.section, start, end],
                    |row| {
                        Ok(AttendanceRow {
                            id: row.get(0)?,
                            student_id: row.get(1)?,
                            roll_no: row.get(2)?,
                            name: row.get(3)?,
                            class: row.get(4)?,
                            section: row.get(5)?,
                            date: row.get(6)?,
                            time: row.get(7)?,
                            status: row.get(8)?,
                            marked_by: row.get(9)?,
                        })
                    },
                )?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn report(&self, filter: ReportFilter) -> Result<AttendanceReport, StoreError> {
        let records = self.attendance_records(filter).await?;
        Ok(AttendanceReport {
            summary: summarize(&records),
            daily: daily_present(&records),
            by_class: class_counts(&records),
            records,
        })
    }

    /// Look up a single student by id.
    pub async fn student(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        self.conn
            .call(move |conn| {
                let student = conn
                    .query_row(
                        "SELECT id, roll_no, name, class, section, email, embedding IS NOT NULL
                         FROM students WHERE id = ?1",
                        [id],
                        |row| {
                            Ok(Identity {
                                id: row.get(0)?,
                                roll_no: row.get(1)?,
                                name: row.get(2)?,
                                class: row.get(3)?,
                                section: row.get(4)?,
                                email: row.get(5)?,
                                has_embedding: row.get(6)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(student)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

impl AttendanceLedger for SqliteStore {
    type Error = StoreError;

    async fn has_record(&self, identity_id: IdentityId, date: NaiveDate) -> Result<bool, StoreError> {
        self.has_attendance(identity_id, date).await
    }

    async fn append_record(&self, record: NewAttendance) -> Result<(), StoreError> {
        self.insert_attendance(&record).await.map(|_| ())
    }
}

impl Roster for SqliteStore {
    type Error = StoreError;

    async fn load_gallery(&self) -> Result<Gallery, StoreError> {
        self.gallery().await
    }

    async fn enroll(&self, identity: NewIdentity, embedding: Embedding) -> Result<Option<IdentityId>, StoreError> {
        self.enroll_student(identity, &embedding).await
    }
}

// ── Report aggregation ────────────────────────────────────────────────────────

pub fn summarize(records: &[AttendanceRow]) -> AttendanceSummary {
    let total = records.len() as u64;
    let present = records.iter().filter(|r| r.status == "Present").count() as u64;
    let absent = records.iter().filter(|r| r.status == "Absent").count() as u64;
    let percent = if total > 0 {
        (present as f64 / total as f64 * 10_000.0).round() / 100.0
    } else {
        0.0
    };
    AttendanceSummary {
        total,
        present,
        absent,
        percent,
    }
}

/// Present rows per date, oldest date first.
pub fn daily_present(records: &[AttendanceRow]) -> Vec<DailyCount> {
    let mut by_date: BTreeMap<&str, u64> = BTreeMap::new();
    for r in records.iter().filter(|r| r.status == "Present") {
        *by_date.entry(r.date.as_str()).or_default() += 1;
    }
    by_date
        .into_iter()
        .map(|(date, present)| DailyCount {
            date: date.to_string(),
            present,
        })
        .collect()
}

pub fn class_counts(records: &[AttendanceRow]) -> Vec<ClassCount> {
    let mut groups: BTreeMap<(&str, &str, &str), u64> = BTreeMap::new();
    for r in records {
        *groups
            .entry((r.class.as_str(), r.section.as_str(), r.status.as_str()))
            .or_default() += 1;
    }
    groups
        .into_iter()
        .map(|((class, section, status), count)| ClassCount {
            class: class.to_string(),
            section: section.to_string(),
            status: status.to_string(),
            count,
        })
        .collect()
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("encryption key file has wrong length ({} bytes, expected 32)", bytes.len()),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    validate_embedding_values(&values)?;
    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}
