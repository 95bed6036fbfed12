//! File and path metadata returned by drivers.

use serde::{Deserialize, Serialize};

/// How much metadata to collect. Each level includes everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum InfoLevel {
    /// Existence only.
    Exists,
    /// Plus the entry type.
    Type,
    /// Plus size and modification time.
    #[default]
    Basic,
    /// Plus mode, ownership and link destination.
    Detail,
}

/// Kind of storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageType {
    /// Regular file or object.
    #[default]
    File,
    /// Directory or object prefix.
    Path,
    /// Symbolic link.
    Link,
    /// Anything else (fifo, socket, device).
    Special,
}

/// Metadata for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageInfo {
    /// Entry name; relative to the listed path inside lists.
    pub name: String,
    /// False when the entry does not exist.
    pub exists: bool,
    /// Entry type.
    pub kind: StorageType,
    /// Size in bytes (files only).
    pub size: u64,
    /// Modification time, epoch seconds.
    pub time_modified: i64,
    /// Permission bits.
    pub mode: u32,
    /// Owner id.
    pub user_id: u32,
    /// Group id.
    pub group_id: u32,
    /// Owner name, when it can be resolved.
    pub user: Option<String>,
    /// Group name, when it can be resolved.
    pub group: Option<String>,
    /// Link target (links only).
    pub link_destination: Option<String>,
}

impl StorageInfo {
    /// Info for an entry that does not exist.
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            ..Self::default()
        }
    }

    /// Drop the fields above `level`.
    pub fn truncate(mut self, level: InfoLevel) -> Self {
        if level < InfoLevel::Detail {
            self.mode = 0;
            self.user_id = 0;
            self.group_id = 0;
            self.user = None;
            self.group = None;
            self.link_destination = None;
        }
        if level < InfoLevel::Basic {
            self.size = 0;
            self.time_modified = 0;
        }
        if level < InfoLevel::Type {
            self.kind = StorageType::default();
        }
        self
    }
}

/// Optional capability of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    /// Real directories exist (as opposed to object prefixes).
    Path,
    /// Content should be compressed by the caller.
    Compress,
    /// Hard links are supported.
    Hardlink,
    /// Symbolic links are supported.
    Symlink,
    /// Paths can be synced.
    PathSync,
    /// Detail-level info is available.
    InfoDetail,
}

impl Feature {
    fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

/// Set of [`Feature`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Features(u64);

impl Features {
    /// Empty set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Set built from a list.
    pub fn of(features: &[Feature]) -> Self {
        features.iter().fold(Self::empty(), |acc, f| acc.with(*f))
    }

    /// Add a feature.
    pub fn with(self, feature: Feature) -> Self {
        Self(self.0 | feature.bit())
    }

    /// Remove a feature.
    pub fn without(self, feature: Feature) -> Self {
        Self(self.0 & !feature.bit())
    }

    /// True when `feature` is in the set.
    pub fn has(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// Raw bits, for the wire.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Rebuild from raw bits.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}
