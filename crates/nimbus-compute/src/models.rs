use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use nimbus_infra::types::{GuestId, GuestShape, ImageSource};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::tracker::Resources;
use crate::{Error, Result};

// ── Flavor ──────────────────────────────────────────────────────────

pub const DEFAULT_CPU_SHARES: u32 = 1024;

/// Immutable hardware profile a server runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flavor {
    pub id: Uuid,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Relative CPU priority against other guests on the host.
    pub cpu_shares: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlavor {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
}

impl Flavor {
    pub fn shape(&self) -> GuestShape {
        GuestShape {
            vcpus: self.vcpus,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
            cpu_shares: self.cpu_shares,
        }
    }

    pub fn resources(&self) -> Resources {
        Resources {
            vcpus: u64::from(self.vcpus),
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
        }
    }
}

// ── Image ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageKind {
    /// Provided by the operator; read-only through the API.
    Operator,
    /// Captured from a server's disk.
    Custom { source_server: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub kind: ImageKind,
    pub checksum: String,
    pub min_ram_mb: u64,
    pub min_disk_gb: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewImage {
    pub name: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub min_ram_mb: u64,
    #[serde(default)]
    pub min_disk_gb: u64,
}

impl Image {
    pub fn source(&self) -> ImageSource {
        ImageSource {
            image_id: self.id,
            checksum: self.checksum.clone(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, ImageKind::Operator)
    }

    /// The flavor must provide at least the image's minimum memory and disk.
    pub fn check_compatible(&self, flavor: &Flavor) -> Result<()> {
        let reason = if flavor.memory_mb < self.min_ram_mb {
            format!(
                "needs {} MB of memory, flavor has {} MB",
                self.min_ram_mb, flavor.memory_mb
            )
        } else if flavor.disk_gb < self.min_disk_gb {
            format!(
                "needs {} GB of disk, flavor has {} GB",
                self.min_disk_gb, flavor.disk_gb
            )
        } else {
            return Ok(());
        };

        Err(Error::IncompatibleImage {
            image: self.id,
            flavor: flavor.id,
            reason,
        })
    }
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RebootKind {
    Soft,
    Hard,
}

/// Lifecycle state of a server.
///
/// Settled states accept new operations; the rest mark an operation in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Building,
    Active,
    Rebooting(RebootKind),
    Rebuilding,
    Resizing,
    ResizeAwaitingConfirmation,
    RevertingResize,
    Paused,
    Suspended,
    Stopped,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "BUILD",
            Self::Active => "ACTIVE",
            Self::Rebooting(RebootKind::Soft) => "REBOOT",
            Self::Rebooting(RebootKind::Hard) => "HARD_REBOOT",
            Self::Rebuilding => "REBUILD",
            Self::Resizing => "RESIZE",
            Self::ResizeAwaitingConfirmation => "VERIFY_RESIZE",
            Self::RevertingResize => "REVERT_RESIZE",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Stopped => "SHUTOFF",
            Self::Error => "ERROR",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Active
                | Self::ResizeAwaitingConfirmation
                | Self::Paused
                | Self::Suspended
                | Self::Stopped
                | Self::Error
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ServerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A resize waiting for confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingResize {
    pub old_flavor_id: Uuid,
    pub new_flavor_id: Uuid,
    /// When the resize is confirmed automatically.
    pub confirm_deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub state: ServerState,
    pub flavor_id: Uuid,
    /// Image the disk was last (re)built from.
    pub image_id: Uuid,
    pub addresses: Vec<Ipv4Addr>,
    pub fault: Option<String>,
    pub pending_resize: Option<PendingResize>,
    #[serde(skip_serializing)]
    pub guest_id: Option<GuestId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
