//! Append-only, hash-linked audit log per session.
//!
//! [`TraceChain`] records what the system did and why: one [`TraceEntry`]
//! per observable milestone, with gap-free sequence numbers and a SHA-256
//! link to the previous entry so post-hoc tampering is detectable via
//! [`TraceChain::verify_integrity`]. Entries are never rewritten.
//!
//! A chain can optionally mirror itself to disk as newline-delimited JSON
//! (one entry per line, append-only) and be reloaded later for post-hoc
//! inspection. The in-memory chain is the engine's source of truth.
//!
//! # Disk Format
//!
//! ```text
//! {"seq":0,"timestamp":"2026-07-01T12:00:00Z","kind":"formulated","payload":{...},"prev_hash":"","hash":"ab12..."}
//! {"seq":1,"timestamp":"2026-07-01T12:00:03Z","kind":"resonance_computed","payload":{...},"prev_hash":"ab12...","hash":"cd34..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Classification of a trace entry. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// The demand was formulated.
    Formulated,
    /// The matcher ranked and selected participants.
    ResonanceComputed,
    /// One offer settled.
    OfferReceived,
    /// One coordinator round (reasoning plus tool results) concluded.
    CoordinatorRound,
    /// The final plan was emitted.
    PlanEmitted,
    /// An error path was taken (including cancellation and eviction of a
    /// slow event subscriber).
    Error,
}

/// A single entry in a [`TraceChain`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Zero-based, gap-free position in the chain.
    pub seq: u64,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Classification of the entry.
    pub kind: TraceKind,
    /// Structured payload describing the milestone.
    pub payload: serde_json::Value,
    /// SHA-256 hex of the previous entry (empty string for the first).
    pub prev_hash: String,
    /// SHA-256 hex of this entry's canonical representation.
    pub hash: String,
}

/// Append-only, SHA-256 hash-chained log of one session's milestones.
///
/// # Example
///
/// ```rust
/// use parley::trace::{TraceChain, TraceKind};
///
/// let mut chain = TraceChain::new("session-1");
/// chain.append(TraceKind::Formulated, serde_json::json!({"intent": "hire a team"})).unwrap();
/// chain.append(TraceKind::PlanEmitted, serde_json::json!({"assignments": 2})).unwrap();
///
/// assert_eq!(chain.entries().len(), 2);
/// assert!(chain.verify_integrity());
/// ```
pub struct TraceChain {
    session_id: String,
    entries: Vec<TraceEntry>,
    file_path: Option<PathBuf>,
}

impl TraceChain {
    /// Create an in-memory chain for the given session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entries: Vec::new(),
            file_path: None,
        }
    }

    /// Create a chain mirrored to `<dir>/<session_id>.jsonl`. The directory
    /// is created if missing; an existing file is loaded back so the chain
    /// continues where it left off.
    pub fn with_persistence(session_id: impl Into<String>, dir: &Path) -> io::Result<Self> {
        let session_id = session_id.into();
        fs::create_dir_all(dir)?;
        let file_path = dir.join(format!("{}.jsonl", session_id));
        let entries = if file_path.exists() {
            Self::read_entries(&file_path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            session_id,
            entries,
            file_path: Some(file_path),
        })
    }

    /// Load a previously persisted chain for inspection.
    pub fn load(session_id: impl Into<String>, path: &Path) -> io::Result<Self> {
        Ok(Self {
            session_id: session_id.into(),
            entries: Self::read_entries(path)?,
            file_path: Some(path.to_path_buf()),
        })
    }

    fn read_entries(path: &Path) -> io::Result<Vec<TraceEntry>> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TraceEntry = serde_json::from_str(&line).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("failed to parse trace entry: {}", e),
                )
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The session this chain belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Append one entry. The sequence number and hash link are assigned
    /// here; callers only supply the kind and payload.
    pub fn append(&mut self, kind: TraceKind, payload: serde_json::Value) -> io::Result<()> {
        let seq = self.entries.len() as u64;
        let timestamp = Utc::now();
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_default();
        let hash = Self::entry_hash(seq, &timestamp, kind, &payload, &prev_hash);
        let entry = TraceEntry {
            seq,
            timestamp,
            kind,
            payload,
            prev_hash,
            hash,
        };

        if let Some(path) = &self.file_path {
            let line = serde_json::to_string(&entry)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", line)?;
        }

        self.entries.push(entry);
        Ok(())
    }

    fn entry_hash(
        seq: u64,
        timestamp: &DateTime<Utc>,
        kind: TraceKind,
        payload: &serde_json::Value,
        prev_hash: &str,
    ) -> String {
        let canonical = format!(
            "{}|{}|{:?}|{}|{}",
            seq,
            timestamp.to_rfc3339(),
            kind,
            payload,
            prev_hash
        );
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Verify the whole chain: gap-free sequence numbers, intact hash
    /// links, and every entry hash matching its canonical representation.
    pub fn verify_integrity(&self) -> bool {
        let mut prev_hash = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.seq != i as u64 || entry.prev_hash != prev_hash {
                return false;
            }
            let expected = Self::entry_hash(
                entry.seq,
                &entry.timestamp,
                entry.kind,
                &entry.payload,
                &entry.prev_hash,
            );
            if entry.hash != expected {
                return false;
            }
            prev_hash = entry.hash.clone();
        }
        true
    }
}
