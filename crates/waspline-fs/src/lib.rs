/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Local storage for inbound WhatsApp media. Payloads are classified by
//! content type, capped per media kind, and filed under a tenant-partitioned
//! directory tree so one tenant's attachments can never be served to another.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

// ---------------------------------------------------------------------------
// Media classification
// ---------------------------------------------------------------------------

/// Media kind as classified from an HTTP content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    /// Classify a content type; `None` for unsupported types.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        match ct.as_str() {
            "image/jpeg" | "image/jpg" | "image/png" | "image/webp" | "image/gif" => {
                Some(Self::Image)
            }
            "audio/mpeg" | "audio/mp3" | "audio/mp4" | "audio/aac" | "audio/ogg" => {
                Some(Self::Audio)
            }
            "video/mp4" | "video/mpeg" | "video/3gpp" => Some(Self::Video),
            "application/pdf"
            | "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "text/plain"
            | "text/csv" => Some(Self::Document),
            _ => None,
        }
    }

    /// Maximum payload size accepted for this kind, in bytes.
    #[must_use]
    pub fn size_cap(self) -> u64 {
        match self {
            Self::Image => 5 * 1024 * 1024,
            Self::Audio | Self::Video => 16 * 1024 * 1024,
            Self::Document => 100 * 1024 * 1024,
        }
    }

    /// Extension files of this kind are stored under. The provider URL's own
    /// name is untrusted and never reaches the filesystem.
    #[must_use]
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "ogg",
            Self::Video => "mp4",
            Self::Document => "bin",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    #[error("media payload is empty")]
    Empty,
    #[error("unsupported media content type '{0}'")]
    UnsupportedType(String),
    #[error("{kind:?} payload of {size} bytes exceeds its {cap}-byte cap")]
    OverCap {
        kind: MediaKind,
        size: u64,
        cap: u64,
    },
    #[error("attachment path '{0}' escapes the media store")]
    PathEscape(String),
    #[error("attachment '{0}' belongs to another tenant")]
    TenantMismatch(String),
    #[error("media store io failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A stored attachment: where it landed and what it was.
#[derive(Debug, Clone)]
pub struct StoredMedia {
    /// Path relative to the store root, `tenant-{id}/{YYYY-MM}/{uuid}.{ext}`.
    pub relative_path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub kind: MediaKind,
}

/// Tenant-partitioned attachment store rooted at a single directory.
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    /// Open a store at `root`, expanding a leading `~`.
    #[must_use]
    pub fn new(root: &str) -> Self {
        let expanded = match (root.strip_prefix("~/"), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
            _ => PathBuf::from(root),
        };
        Self { root: expanded }
    }

    fn tenant_prefix(tenant_id: i64) -> String {
        format!("tenant-{tenant_id}")
    }

    /// Persist one media payload for a tenant. The kind is derived from the
    /// content type and drives both the size cap and the on-disk extension.
    ///
    /// # Errors
    ///
    /// `MediaError` for empty payloads, unsupported types, payloads over the
    /// kind's cap, and filesystem failures.
    pub fn store(
        &self,
        tenant_id: i64,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredMedia, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }
        let kind = MediaKind::from_content_type(content_type)
            .ok_or_else(|| MediaError::UnsupportedType(content_type.to_string()))?;
        let size = bytes.len() as u64;
        let cap = kind.size_cap();
        if size > cap {
            return Err(MediaError::OverCap { kind, size, cap });
        }

        let month = chrono::Utc::now().format("%Y-%m").to_string();
        let dir = self
            .root
            .join(Self::tenant_prefix(tenant_id))
            .join(&month);
        std::fs::create_dir_all(&dir).map_err(|source| MediaError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let file_name = format!("{}.{}", uuid::Uuid::new_v4(), kind.default_extension());
        let final_path = dir.join(&file_name);
        let partial_path = dir.join(format!("{file_name}.part"));

        // A crash between the two steps leaves only a .part file behind,
        // never a half-written attachment under its final name.
        std::fs::write(&partial_path, bytes).map_err(|source| MediaError::Io {
            path: partial_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&partial_path, &final_path).map_err(|source| MediaError::Io {
            path: final_path.display().to_string(),
            source,
        })?;

        Ok(StoredMedia {
            relative_path: format!("{}/{month}/{file_name}", Self::tenant_prefix(tenant_id)),
            sha256: hex::encode(Sha256::digest(bytes)),
            size_bytes: size,
            kind,
        })
    }

    /// Read an attachment back, enforcing that the path stays inside the
    /// store and inside the calling tenant's partition.
    ///
    /// # Errors
    ///
    /// `MediaError::PathEscape` for traversal attempts,
    /// `MediaError::TenantMismatch` for cross-tenant reads, `MediaError::Io`
    /// for missing files.
    pub fn load(&self, tenant_id: i64, relative_path: &str) -> Result<Vec<u8>, MediaError> {
        let relative = Path::new(relative_path);
        let traversal = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if traversal {
            return Err(MediaError::PathEscape(relative_path.to_string()));
        }

        let expected_prefix = Self::tenant_prefix(tenant_id);
        let first_segment = relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str());
        if first_segment != Some(expected_prefix.as_str()) {
            return Err(MediaError::TenantMismatch(relative_path.to_string()));
        }

        let full = self.root.join(relative);
        std::fs::read(&full).map_err(|source| MediaError::Io {
            path: full.display().to_string(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> MediaStore {
        MediaStore::new(dir.path().to_str().unwrap())
    }

    #[test]
    fn test_store_partitions_by_tenant_and_month() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let stored = store.store(7, "image/png", b"png-bytes").unwrap();

        let segments: Vec<&str> = stored.relative_path.split('/').collect();
        assert_eq!(segments.len(), 3, "tenant/month/file: {}", stored.relative_path);
        assert_eq!(segments[0], "tenant-7");
        assert_eq!(segments[1].len(), 7, "month segment is YYYY-MM");
        assert!(segments[2].ends_with(".jpg"), "image kind names the extension");
        assert_eq!(stored.kind, MediaKind::Image);
        assert_eq!(stored.size_bytes, 9);
        assert!(dir.path().join(&stored.relative_path).exists());
    }

    #[test]
    fn test_extension_comes_from_kind_not_caller() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        // A voice note: the provider URL may have ended in .php for all we
        // care — classification decides the suffix.
        let stored = store.store(1, "audio/ogg; codecs=opus", b"voice").unwrap();
        assert!(stored.relative_path.ends_with(".ogg"));
        assert_eq!(stored.kind, MediaKind::Audio);
    }

    #[test]
    fn test_cap_is_driven_by_media_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        // 6 MiB: over the image cap, comfortably under the audio cap.
        let six_mib = vec![0u8; 6 * 1024 * 1024];
        let err = store.store(1, "image/jpeg", &six_mib).unwrap_err();
        match err {
            MediaError::OverCap { kind, cap, .. } => {
                assert_eq!(kind, MediaKind::Image);
                assert_eq!(cap, 5 * 1024 * 1024);
            }
            other => panic!("expected OverCap, got {other}"),
        }
        assert!(
            store.store(1, "audio/mpeg", &six_mib).is_ok(),
            "the same bytes are fine as audio"
        );
    }

    #[test]
    fn test_unsupported_and_empty_payloads_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(matches!(
            store.store(1, "application/zip", b"zip"),
            Err(MediaError::UnsupportedType(_))
        ));
        assert!(matches!(
            store.store(1, "image/png", b""),
            Err(MediaError::Empty)
        ));
    }

    #[test]
    fn test_load_round_trip_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let stored = store.store(3, "application/pdf", b"%PDF-1.7 fake").unwrap();
        let bytes = store.load(3, &stored.relative_path).unwrap();
        assert_eq!(bytes, b"%PDF-1.7 fake");
        assert_eq!(
            stored.sha256,
            hex::encode(Sha256::digest(b"%PDF-1.7 fake")),
            "digest covers the stored bytes"
        );
    }

    #[test]
    fn test_load_rejects_cross_tenant_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let stored = store.store(3, "image/webp", b"webp").unwrap();
        let err = store.load(4, &stored.relative_path).unwrap_err();
        assert!(
            matches!(err, MediaError::TenantMismatch(_)),
            "tenant 4 must not read tenant 3's attachment: {err}"
        );
    }

    #[test]
    fn test_load_rejects_traversal_and_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        for bad in ["../secrets.txt", "tenant-1/../../x", "/etc/passwd"] {
            assert!(
                matches!(store.load(1, bad), Err(MediaError::PathEscape(_))),
                "'{bad}' must be refused"
            );
        }
    }

    #[test]
    fn test_media_kind_classification() {
        assert_eq!(
            MediaKind::from_content_type("image/jpeg; charset=binary"),
            Some(MediaKind::Image),
            "parameters after ';' must be ignored"
        );
        assert_eq!(
            MediaKind::from_content_type("AUDIO/OGG"),
            Some(MediaKind::Audio)
        );
        assert_eq!(
            MediaKind::from_content_type("video/3gpp"),
            Some(MediaKind::Video)
        );
        assert_eq!(MediaKind::from_content_type("application/zip"), None);
    }

    #[test]
    fn test_media_kind_size_caps() {
        assert_eq!(MediaKind::Image.size_cap(), 5 * 1024 * 1024);
        assert_eq!(MediaKind::Audio.size_cap(), 16 * 1024 * 1024);
        assert_eq!(MediaKind::Video.size_cap(), 16 * 1024 * 1024);
        assert_eq!(MediaKind::Document.size_cap(), 100 * 1024 * 1024);
    }
}
