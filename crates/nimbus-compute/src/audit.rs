//! Reconciliation of hypervisor guests against server records.
//!
//! Delete and resize confirmation destroy guests best effort. A guest whose
//! destroy failed keeps running with nothing tracking it; the audit finds
//! such guests and destroys them.

use nimbus_infra::types::{GuestId, GuestInfo};
use tracing::{info, warn};

use crate::{ComputeService, Result};

/// Outcome of one audit pass.
#[derive(Debug, Default)]
pub struct AuditReport {
    /// Guests reported by the driver.
    pub guests: usize,
    /// Guests no server owns.
    pub orphans: Vec<GuestId>,
    /// Orphans destroyed during this pass.
    pub destroyed: usize,
}

impl ComputeService {
    /// Destroy every guest that no server or pending resize owns.
    pub async fn audit(&self) -> Result<AuditReport> {
        let guests = self.inner.driver.list_guests().await?;
        let mut report = AuditReport {
            guests: guests.len(),
            ..AuditReport::default()
        };

        for guest in guests {
            if self.owns(&guest) {
                continue;
            }

            warn!(guest_id = %guest.id, server_id = %guest.server_id, "orphaned guest found");
            match self.inner.driver.destroy(&guest.id).await {
                Ok(()) => report.destroyed += 1,
                Err(e) => {
                    warn!(guest_id = %guest.id, error = %e, "failed to destroy orphaned guest");
                }
            }
            report.orphans.push(guest.id);
        }

        if !report.orphans.is_empty() {
            info!(
                guests = report.guests,
                orphans = report.orphans.len(),
                destroyed = report.destroyed,
                "guest audit finished"
            );
        }
        Ok(report)
    }

    fn owns(&self, guest: &GuestInfo) -> bool {
        let Ok(slot) = self.slot(guest.server_id) else {
            return false;
        };
        // An operation in flight may be building or replacing guests.
        let Ok(record) = slot.record.try_lock() else {
            return true;
        };
        if record.deleted {
            return false;
        }
        record.server.guest_id.as_ref() == Some(&guest.id)
            || record
                .resize
                .as_ref()
                .is_some_and(|ticket| ticket.old_guest == guest.id)
    }
}
