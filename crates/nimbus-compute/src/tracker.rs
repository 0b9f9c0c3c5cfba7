//! Host resource accounting.
//!
//! Every server holds at most one instance claim and, while a resize is
//! pending, one migration claim for the target flavor. Claims are additive
//! against the host's limits; a claim that would exceed a limit changes
//! nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub vcpus: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl Resources {
    /// The part of a claim that survives when memory is saved to disk.
    pub fn disk_only(self) -> Self {
        Self {
            vcpus: 0,
            memory_mb: 0,
            disk_gb: self.disk_gb,
        }
    }

    fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            vcpus: self.vcpus.checked_add(other.vcpus)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            disk_gb: self.disk_gb.checked_add(other.disk_gb)?,
        })
    }

    fn saturating_sub(self, other: Self) -> Self {
        Self {
            vcpus: self.vcpus.saturating_sub(other.vcpus),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
        }
    }
}

/// Physical capacity of the host plus overcommit ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vcpus: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub cpu_allocation_ratio: f64,
    pub ram_allocation_ratio: f64,
}

impl Default for HostCapacity {
    fn default() -> Self {
        Self {
            vcpus: 32,
            memory_mb: 131_072,
            disk_gb: 2048,
            cpu_allocation_ratio: 16.0,
            ram_allocation_ratio: 1.5,
        }
    }
}

impl HostCapacity {
    /// Claimable totals after applying the allocation ratios.
    pub fn limits(&self) -> Resources {
        Resources {
            vcpus: (self.vcpus as f64 * self.cpu_allocation_ratio).floor() as u64,
            memory_mb: (self.memory_mb as f64 * self.ram_allocation_ratio).floor() as u64,
            disk_gb: self.disk_gb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Resources of the flavor the server currently runs with.
    Instance,
    /// Resources of a resize target, held until confirm or revert.
    Migration,
}

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub used: Resources,
    pub free: Resources,
    pub limits: Resources,
    pub claims: usize,
}

#[derive(Default)]
struct Claims {
    by_key: HashMap<(Uuid, ClaimKind), Resources>,
    used: Resources,
}

pub struct ResourceTracker {
    capacity: HostCapacity,
    claims: Mutex<Claims>,
}

impl ResourceTracker {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            capacity,
            claims: Mutex::new(Claims::default()),
        }
    }

    pub fn capacity(&self) -> HostCapacity {
        self.capacity
    }

    /// Take a new claim, or replace an existing one of the same kind.
    ///
    /// Only growth is checked against the limits, so shrinking a claim never
    /// fails.
    pub fn claim(&self, server: Uuid, kind: ClaimKind, resources: Resources) -> Result<()> {
        let mut claims = self.lock();
        let previous = claims
            .by_key
            .get(&(server, kind))
            .copied()
            .unwrap_or_default();
        let used = claims
            .used
            .saturating_sub(previous)
            .checked_add(resources)
            .ok_or_else(|| {
                Error::InsufficientCapacity(format!("claim {resources:?} exceeds host limits"))
            })?;

        let limits = self.capacity.limits();
        let over = [
            ("vcpus", resources.vcpus > previous.vcpus, used.vcpus, limits.vcpus),
            (
                "memory_mb",
                resources.memory_mb > previous.memory_mb,
                used.memory_mb,
                limits.memory_mb,
            ),
            (
                "disk_gb",
                resources.disk_gb > previous.disk_gb,
                used.disk_gb,
                limits.disk_gb,
            ),
        ]
        .into_iter()
        .find(|(_, grows, used, limit)| *grows && used > limit);

        if let Some((resource, _, used, limit)) = over {
            return Err(Error::InsufficientCapacity(format!(
                "{resource} would reach {used} of {limit}"
            )));
        }

        claims.by_key.insert((server, kind), resources);
        claims.used = used;
        Ok(())
    }

    /// Drop one claim, returning what it held.
    pub fn release(&self, server: Uuid, kind: ClaimKind) -> Option<Resources> {
        let mut claims = self.lock();
        let released = claims.by_key.remove(&(server, kind))?;
        claims.used = claims.used.saturating_sub(released);
        Some(released)
    }

    /// Drop every claim the server holds.
    pub fn release_server(&self, server: Uuid) {
        self.release(server, ClaimKind::Instance);
        self.release(server, ClaimKind::Migration);
    }

    /// Make the migration claim the server's instance claim, releasing the
    /// previous instance claim.
    pub fn promote(&self, server: Uuid) {
        let mut claims = self.lock();
        let Some(migration) = claims.by_key.remove(&(server, ClaimKind::Migration)) else {
            return;
        };
        if let Some(previous) = claims.by_key.insert((server, ClaimKind::Instance), migration) {
            claims.used = claims.used.saturating_sub(previous);
        }
    }

    pub fn claim_of(&self, server: Uuid, kind: ClaimKind) -> Option<Resources> {
        self.lock().by_key.get(&(server, kind)).copied()
    }

    pub fn usage(&self) -> Usage {
        let claims = self.lock();
        let limits = self.capacity.limits();
        Usage {
            used: claims.used,
            free: limits.saturating_sub(claims.used),
            limits,
            claims: claims.by_key.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
