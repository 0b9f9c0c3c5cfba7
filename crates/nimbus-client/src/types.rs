use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Flavor types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: Uuid,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub cpu_shares: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFlavorRequest {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u32>,
}

// ── Image types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageKind {
    Operator,
    Custom { source_server: Uuid },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub kind: ImageKind,
    pub checksum: String,
    pub min_ram_mb: u64,
    pub min_disk_gb: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateImageRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub min_ram_mb: u64,
    pub min_disk_gb: u64,
}

// ── Server types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub flavor_id: Uuid,
    pub image_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingResize {
    pub old_flavor_id: Uuid,
    pub new_flavor_id: Uuid,
    pub confirm_deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    /// Wire status such as `ACTIVE` or `VERIFY_RESIZE`.
    pub status: String,
    pub flavor_id: Uuid,
    pub image_id: Uuid,
    pub addresses: Vec<Ipv4Addr>,
    pub fault: Option<String>,
    pub pending_resize: Option<PendingResize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RebootType {
    Soft,
    Hard,
}

// ── Host types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Resources {
    pub vcpus: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostUsage {
    pub limits: Resources,
    pub used: Resources,
    pub free: Resources,
    pub claims: usize,
    pub servers: usize,
}
