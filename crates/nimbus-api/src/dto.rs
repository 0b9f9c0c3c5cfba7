use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use nimbus_compute::ServerState;
use nimbus_compute::models::{PendingResize, RebootKind, Server};
use nimbus_compute::tracker::{HostCapacity, Resources, Usage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub flavor_id: Uuid,
    pub image_id: Uuid,
}

/// Body of `POST /servers/{id}/action`: a single-key object naming the
/// action.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerAction {
    Reboot {
        #[serde(rename = "type")]
        kind: RebootKind,
    },
    Rebuild {
        image_id: Uuid,
    },
    Resize {
        flavor_id: Uuid,
    },
    ConfirmResize,
    RevertResize,
    Pause,
    Unpause,
    Suspend,
    Resume,
    #[serde(rename = "os-stop")]
    Stop,
    #[serde(rename = "os-start")]
    Start,
    CreateImage {
        name: String,
    },
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: Uuid,
    pub name: String,
    pub status: ServerState,
    pub flavor_id: Uuid,
    pub image_id: Uuid,
    pub addresses: Vec<Ipv4Addr>,
    pub fault: Option<String>,
    pub pending_resize: Option<PendingResize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Server> for ServerResponse {
    fn from(s: Server) -> Self {
        Self {
            id: s.id,
            name: s.name,
            status: s.state,
            flavor_id: s.flavor_id,
            image_id: s.image_id,
            addresses: s.addresses,
            fault: s.fault,
            pending_resize: s.pending_resize,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HostUsageResponse {
    pub capacity: HostCapacity,
    pub limits: Resources,
    pub used: Resources,
    pub free: Resources,
    pub claims: usize,
    pub servers: usize,
}

impl HostUsageResponse {
    pub fn new(capacity: HostCapacity, usage: Usage, servers: usize) -> Self {
        Self {
            capacity,
            limits: usage.limits,
            used: usage.used,
            free: usage.free,
            claims: usage.claims,
            servers,
        }
    }
}
