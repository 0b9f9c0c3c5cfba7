use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque driver-side guest identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestId(pub String);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware shape of a guest, derived from a flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestShape {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub cpu_shares: u32,
}

/// The image content a guest disk is written from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub image_id: Uuid,
    pub checksum: String,
}

/// Parameters for spawning a guest.
#[derive(Debug, Clone)]
pub struct GuestSpec {
    /// Server the guest belongs to; carried by every guest built from it.
    pub server_id: Uuid,
    pub name: String,
    pub shape: GuestShape,
    pub image: ImageSource,
    pub addresses: Vec<Ipv4Addr>,
}

/// Guest status returned from the driver.
#[derive(Debug, Clone)]
pub struct GuestInfo {
    pub id: GuestId,
    pub server_id: Uuid,
    pub power_state: PowerState,
    pub shape: GuestShape,
}

/// Driver-reported power state of the underlying virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    /// Frozen with memory held in RAM.
    Paused,
    /// Memory saved to disk, execution stopped.
    Suspended,
    Shutdown,
}

/// What is on a guest's disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskContents {
    /// Image the disk was last written from.
    pub image_id: Uuid,
    pub image_checksum: String,
    /// Files written by the guest since the disk was built.
    pub files: BTreeSet<String>,
}

impl DiskContents {
    pub fn from_image(image: &ImageSource) -> Self {
        Self {
            image_id: image.image_id,
            image_checksum: image.checksum.clone(),
            files: BTreeSet::new(),
        }
    }

    /// Digest over the image checksum and every written file path.
    pub fn checksum(&self) -> String {
        let mut parts: Vec<&[u8]> = vec![self.image_checksum.as_bytes()];
        parts.extend(self.files.iter().map(|f| f.as_bytes()));
        checksum(&parts)
    }
}

/// Result of capturing a guest disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshot {
    pub checksum: String,
}

/// Base64-encoded SHA-256 over the concatenated parts.
pub fn checksum(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    STANDARD.encode(hasher.finalize())
}
