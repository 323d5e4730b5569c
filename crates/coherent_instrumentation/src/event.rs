//! Metric events emitted by the tensor runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A representation refresh performed by the synchronisation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    StagingToBuffer,
    BufferToStaging,
    BufferToImage,
    ImageToBuffer,
}

impl Conversion {
    pub const fn as_str(self) -> &'static str {
        match self {
            Conversion::StagingToBuffer => "staging->buffer",
            Conversion::BufferToStaging => "buffer->staging",
            Conversion::BufferToImage => "buffer->image",
            Conversion::ImageToBuffer => "image->buffer",
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    PerOperation,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Buffer,
    StagingBuffer,
    Image,
}

/// Structured metric events. Serialised as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MetricEvent {
    /// A stale representation was rebuilt from an authoritative one.
    RepresentationRefreshed {
        conversion: Conversion,
        bytes: u64,
        duration_us: u64,
    },
    /// A pool handed out an allocation, either fresh or recycled.
    PoolAllocation {
        pool: PoolKind,
        resource: ResourceKind,
        bytes: u64,
        reused: bool,
    },
    /// A per-operation pool was reset and its allocations reclaimed.
    PoolReset { pool: PoolKind, generation: u64, reclaimed: u64 },
    /// Host writes were uploaded to the device buffer when a write future ended.
    HostWriteback { bytes: u64, eager: bool },
    /// A representation was mapped for host access.
    HostMapped { resource: ResourceKind, bytes: u64, writable: bool },
}
