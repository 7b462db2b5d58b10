//! Snapshot envelope encoding and decoding.
//!
//! A backup file is a JSON envelope:
//!
//! ```text
//! { "version": 1, "createdAt": "...", "tables": { "<name>": [Record, ...] } }
//! ```
//!
//! With a password, `tables` is replaced by a base64 `ciphertext` holding the
//! plaintext envelope above, and an `encryption` block records the salt, IV
//! and KDF parameters in the clear. `version` and `createdAt` are bound to the
//! ciphertext as associated data, so neither can be edited without detection.

use crate::config::BackupConfig;
use crate::crypto::{
    random_iv, random_salt, BackupKey, SnapshotCipher, KDF_NAME, MAX_KDF_ITERATIONS, SALT_SIZE,
};
use crate::error::{BackupError, BackupResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use studysync_store::{is_system_table, user_tables, LocalStore, Record};

/// Envelope format version written by this codec.
pub const FORMAT_VERSION: u32 = 1;

/// Options for writing a backup.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Encrypts the snapshot when set.
    pub password: Option<String>,
}

impl BackupOptions {
    /// Options for an unencrypted backup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypts the backup with `password`.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// A decoded snapshot of every user table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupSnapshot {
    /// Envelope format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Records by table, each ordered by id.
    pub tables: BTreeMap<String, Vec<Record>>,
}

impl BackupSnapshot {
    /// Returns the record count per table.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.tables
            .iter()
            .map(|(name, records)| (name.clone(), records.len()))
            .collect()
    }

    /// Returns the total number of records.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Iterates every record in table then id order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.tables.values().flatten()
    }
}

/// An encoded backup ready to be saved or downloaded.
#[derive(Debug, Clone)]
pub struct BackupFile {
    /// Suggested file name.
    pub file_name: String,
    /// Encoded envelope.
    pub bytes: Vec<u8>,
    /// Embedded creation time.
    pub created_at: DateTime<Utc>,
    /// Records per table.
    pub counts: BTreeMap<String, usize>,
    /// Whether the envelope is encrypted.
    pub encrypted: bool,
}

/// The clear part of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupHeader {
    /// Envelope format version.
    pub version: u32,
    /// Embedded creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the envelope is encrypted.
    pub encrypted: bool,
}

/// Result of validating a backup without applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupPreview {
    /// Records per table in the backup.
    pub incoming_counts: BTreeMap<String, usize>,
    /// Envelope format version.
    pub version: u32,
    /// Embedded creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the envelope was encrypted.
    pub encrypted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    version: u32,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tables: Option<BTreeMap<String, Vec<Record>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<EncryptionHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ciphertext: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptionHeader {
    salt: String,
    iv: String,
    kdf: KdfParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct KdfParams {
    name: String,
    iterations: u32,
}

/// Serializes and deserializes full-database snapshots.
#[derive(Debug, Clone)]
pub struct BackupCodec {
    config: BackupConfig,
}

impl BackupCodec {
    /// Creates a codec.
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Reads every user table of `store` into a snapshot.
    pub fn snapshot(
        &self,
        store: &dyn LocalStore,
        created_at: DateTime<Utc>,
    ) -> BackupResult<BackupSnapshot> {
        let mut tables = BTreeMap::new();
        for table in user_tables(store)? {
            let mut records = store.list_all(&table)?;
            records.sort_by(|a, b| a.id.cmp(&b.id));
            tables.insert(table, records);
        }
        Ok(BackupSnapshot {
            version: FORMAT_VERSION,
            created_at: created_at.trunc_subsecs(3),
            tables,
        })
    }

    /// Snapshots `store` now and encodes it.
    pub fn write_backup(
        &self,
        store: &dyn LocalStore,
        options: &BackupOptions,
    ) -> BackupResult<BackupFile> {
        self.write_backup_at(store, options, Utc::now())
    }

    /// Snapshots `store` with an explicit creation time and encodes it.
    pub fn write_backup_at(
        &self,
        store: &dyn LocalStore,
        options: &BackupOptions,
        created_at: DateTime<Utc>,
    ) -> BackupResult<BackupFile> {
        let snapshot = self.snapshot(store, created_at)?;
        let bytes = self.encode(&snapshot, options.password.as_deref())?;

        tracing::info!(
            tables = snapshot.tables.len(),
            records = snapshot.record_count(),
            encrypted = options.password.is_some(),
            "backup written"
        );

        Ok(BackupFile {
            file_name: self.file_name(snapshot.created_at),
            bytes,
            created_at: snapshot.created_at,
            counts: snapshot.counts(),
            encrypted: options.password.is_some(),
        })
    }

    /// Encodes a snapshot, encrypting it when a password is given.
    pub fn encode(&self, snapshot: &BackupSnapshot, password: Option<&str>) -> BackupResult<Vec<u8>> {
        let plain = Envelope {
            version: snapshot.version,
            created_at: snapshot.created_at,
            tables: Some(snapshot.tables.clone()),
            encryption: None,
            ciphertext: None,
        };
        let plaintext = serde_json::to_vec(&plain).map_err(json_error)?;

        let Some(password) = password else {
            return Ok(plaintext);
        };

        let salt = random_salt();
        let iv = random_iv();
        let iterations = self.config.kdf_iterations;
        let key = BackupKey::derive(password, &salt, iterations);
        let aad = associated_data(snapshot.version, &snapshot.created_at);
        let sealed = SnapshotCipher::new(&key).encrypt(&iv, &plaintext, &aad)?;

        let envelope = Envelope {
            version: snapshot.version,
            created_at: snapshot.created_at,
            tables: None,
            encryption: Some(EncryptionHeader {
                salt: STANDARD.encode(salt),
                iv: STANDARD.encode(iv),
                kdf: KdfParams {
                    name: KDF_NAME.to_string(),
                    iterations,
                },
            }),
            ciphertext: Some(STANDARD.encode(sealed)),
        };
        serde_json::to_vec(&envelope).map_err(json_error)
    }

    /// Parses only the clear header. Never needs a password.
    pub fn read_header(&self, bytes: &[u8]) -> BackupResult<BackupHeader> {
        let envelope = parse_envelope(bytes)?;
        Ok(BackupHeader {
            version: envelope.version,
            created_at: envelope.created_at,
            encrypted: envelope.encryption.is_some(),
        })
    }

    /// Parses, decrypts if needed and validates a backup.
    ///
    /// # Errors
    ///
    /// - [`BackupError::Validation`] for corrupt or unsupported files
    /// - [`BackupError::PasswordRequired`] for encrypted files without a password
    /// - [`BackupError::Decryption`] for a wrong password
    pub fn read_backup(&self, bytes: &[u8], password: Option<&str>) -> BackupResult<BackupSnapshot> {
        let envelope = parse_envelope(bytes)?;

        let tables = match envelope.encryption {
            None => {
                if envelope.ciphertext.is_some() {
                    return Err(BackupError::validation(
                        "ciphertext present without encryption parameters",
                    ));
                }
                envelope
                    .tables
                    .ok_or_else(|| BackupError::validation("missing tables"))?
            }
            Some(header) => {
                if envelope.tables.is_some() {
                    return Err(BackupError::validation(
                        "encrypted backup must not carry clear tables",
                    ));
                }
                let ciphertext = envelope
                    .ciphertext
                    .ok_or_else(|| BackupError::validation("missing ciphertext"))?;
                let password = password.ok_or(BackupError::PasswordRequired)?;
                let inner = decrypt_envelope(
                    &header,
                    &ciphertext,
                    password,
                    envelope.version,
                    &envelope.created_at,
                )?;
                if inner.version != envelope.version || inner.created_at != envelope.created_at {
                    return Err(BackupError::validation(
                        "encrypted header does not match its contents",
                    ));
                }
                inner
                    .tables
                    .ok_or_else(|| BackupError::validation("missing tables"))?
            }
        };

        validate_tables(&tables)?;
        Ok(BackupSnapshot {
            version: envelope.version,
            created_at: envelope.created_at,
            tables,
        })
    }

    /// Validates a backup and counts its records without touching any store.
    pub fn validate_backup_file(
        &self,
        bytes: &[u8],
        password: Option<&str>,
    ) -> BackupResult<BackupPreview> {
        let encrypted = self.read_header(bytes)?.encrypted;
        let snapshot = self.read_backup(bytes, password)?;
        Ok(BackupPreview {
            incoming_counts: snapshot.counts(),
            version: snapshot.version,
            created_at: snapshot.created_at,
            encrypted,
        })
    }

    /// Returns the file name for a snapshot taken at `created_at`.
    pub fn file_name(&self, created_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}.json",
            self.config.file_prefix,
            created_at.format("%Y-%m-%dT%H-%M-%S-%3fZ")
        )
    }

    /// Returns true if `name` follows this codec's naming pattern.
    pub fn is_own_file_name(&self, name: &str) -> bool {
        name.strip_prefix(self.config.file_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|rest| rest.len() > ".json".len() && rest.ends_with(".json"))
    }
}

fn json_error(err: serde_json::Error) -> BackupError {
    BackupError::validation(err.to_string())
}

fn associated_data(version: u32, created_at: &DateTime<Utc>) -> Vec<u8> {
    format!(
        "studysync-backup:v{version}:{}",
        created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
    .into_bytes()
}

fn parse_envelope(bytes: &[u8]) -> BackupResult<Envelope> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| BackupError::validation(format!("not a StudySync backup: {e}")))?;
    if envelope.version == 0 || envelope.version > FORMAT_VERSION {
        return Err(BackupError::validation(format!(
            "unsupported backup version {}",
            envelope.version
        )));
    }
    Ok(envelope)
}

fn decrypt_envelope(
    header: &EncryptionHeader,
    ciphertext: &str,
    password: &str,
    version: u32,
    created_at: &DateTime<Utc>,
) -> BackupResult<Envelope> {
    if header.kdf.name != KDF_NAME {
        return Err(BackupError::validation(format!(
            "unsupported key derivation {}",
            header.kdf.name
        )));
    }
    if header.kdf.iterations == 0 || header.kdf.iterations > MAX_KDF_ITERATIONS {
        return Err(BackupError::validation(format!(
            "unsupported iteration count {}",
            header.kdf.iterations
        )));
    }

    let salt = decode_field("salt", &header.salt)?;
    if salt.len() != SALT_SIZE {
        return Err(BackupError::validation(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            salt.len()
        )));
    }
    let iv = decode_field("iv", &header.iv)?;
    let sealed = STANDARD
        .decode(ciphertext)
        .map_err(|e| BackupError::decryption(format!("ciphertext is corrupted: {e}")))?;

    let key = BackupKey::derive(password, &salt, header.kdf.iterations);
    let aad = associated_data(version, created_at);
    let plaintext = SnapshotCipher::new(&key).decrypt(&iv, &sealed, &aad)?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| BackupError::validation(format!("decrypted payload is not a snapshot: {e}")))
}

fn decode_field(name: &str, value: &str) -> BackupResult<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| BackupError::validation(format!("{name} is not valid base64: {e}")))
}

fn validate_tables(tables: &BTreeMap<String, Vec<Record>>) -> BackupResult<()> {
    for (name, records) in tables {
        if name.is_empty() {
            return Err(BackupError::validation("empty table name"));
        }
        if is_system_table(name) {
            return Err(BackupError::validation(format!(
                "backup contains system table {name}"
            )));
        }
        let mut seen = BTreeSet::new();
        for record in records {
            if record.table != *name {
                return Err(BackupError::validation(format!(
                    "record {} claims table {} but is stored under {name}",
                    record.id, record.table
                )));
            }
            if !seen.insert(record.id.as_str()) {
                return Err(BackupError::validation(format!(
                    "duplicate record {name}/{}",
                    record.id
                )));
            }
        }
    }
    Ok(())
}
