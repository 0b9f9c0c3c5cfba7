//! Resize with confirmation.
//!
//! A resize builds a new guest with the target shape while the old guest is
//! kept stopped. Both flavors stay claimed until the resize is confirmed or
//! reverted; a per-resize timer confirms it once the confirm window passes.
//! Whichever of confirm, revert, delete or the timer takes the ticket out of
//! the record first wins; the others find nothing to do.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nimbus_infra::types::GuestId;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lifecycle::Operation;
use crate::models::{Flavor, PendingResize, Server, ServerState};
use crate::service::{ComputeService, Locked, ResizeTicket};
use crate::tracker::ClaimKind;
use crate::{Error, Result};

impl ComputeService {
    /// Move the server to `flavor_id`. The server passes through `RESIZE`
    /// and waits in `VERIFY_RESIZE` for confirm or revert.
    pub fn resize(&self, id: Uuid, flavor_id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Resize)?;
        let target = self.inner.catalog.get_flavor(flavor_id)?;
        let current = self.inner.catalog.get_flavor(locked.server().flavor_id)?;

        if target.id == current.id {
            return Err(Error::InvalidResize(format!(
                "server already runs flavor {}",
                current.name
            )));
        }
        if target.disk_gb < current.disk_gb {
            return Err(Error::InvalidResize(format!(
                "disk cannot shrink from {} GB to {} GB",
                current.disk_gb, target.disk_gb
            )));
        }
        // A deleted custom image no longer constrains the server.
        if let Ok(image) = self.inner.catalog.get_image(locked.server().image_id) {
            image.check_compatible(&target)?;
        }
        let guest = locked.guest(Operation::Resize)?;

        self.inner
            .tracker
            .claim(id, ClaimKind::Migration, target.resources())?;

        info!(server_id = %id, from = %current.name, to = %target.name, "resizing server");
        locked.set_state(ServerState::Resizing);
        let server = locked.snapshot();

        let svc = self.clone();
        tokio::spawn(async move { svc.finish_resize(locked, guest, current, target).await });
        Ok(server)
    }

    async fn finish_resize(
        &self,
        mut locked: Locked,
        old_guest: GuestId,
        old_flavor: Flavor,
        target: Flavor,
    ) {
        let id = locked.id();
        let info = match self.inner.driver.migrate(&old_guest, &target.shape()).await {
            Ok(info) => info,
            Err(e) => {
                error!(server_id = %id, error = %e, "resize failed");
                self.inner.tracker.release(id, ClaimKind::Migration);
                locked.settle_with_fault(ServerState::Active, format!("resize failed: {e}"));
                return;
            }
        };

        let window = self.inner.config.resize_confirm_window;
        let now = Utc::now();
        let confirm_deadline = TimeDelta::from_std(window)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let resize_id = Uuid::new_v4();
        let timer = self.spawn_auto_confirm(id, resize_id, window);
        locked.record.resize = Some(ResizeTicket {
            id: resize_id,
            old_flavor: old_flavor.clone(),
            old_guest,
            timer,
        });

        let server = &mut locked.record.server;
        server.guest_id = Some(info.id);
        server.flavor_id = target.id;
        server.pending_resize = Some(PendingResize {
            old_flavor_id: old_flavor.id,
            new_flavor_id: target.id,
            confirm_deadline,
        });
        locked.settle(ServerState::ResizeAwaitingConfirmation);
    }

    /// Keep the new flavor and drop the old guest.
    pub async fn confirm_resize(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::ConfirmResize)?;
        let ticket = take_ticket(&mut locked, Operation::ConfirmResize)?;
        ticket.timer.abort();

        self.apply_confirm(&mut locked, ticket).await;
        Ok(locked.snapshot())
    }

    /// Go back to the old flavor and guest.
    pub async fn revert_resize(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::RevertResize)?;
        let new_guest = locked.guest(Operation::RevertResize)?;
        let ticket = take_ticket(&mut locked, Operation::RevertResize)?;
        ticket.timer.abort();

        locked.set_state(ServerState::RevertingResize);
        if let Err(e) = self.inner.driver.destroy(&new_guest).await {
            warn!(server_id = %id, guest_id = %new_guest, error = %e, "failed to destroy resized guest");
        }
        self.inner.tracker.release(id, ClaimKind::Migration);

        let server = &mut locked.record.server;
        server.guest_id = Some(ticket.old_guest.clone());
        server.flavor_id = ticket.old_flavor.id;
        server.pending_resize = None;

        if let Err(e) = self.inner.driver.power_on(&ticket.old_guest).await {
            error!(server_id = %id, error = %e, "failed to restart guest after revert");
            locked.settle_with_fault(ServerState::Error, format!("revert failed: {e}"));
            return Err(Error::Driver(e));
        }

        info!(server_id = %id, flavor = %ticket.old_flavor.name, "resize reverted");
        locked.settle(ServerState::Active);
        Ok(locked.snapshot())
    }

    async fn apply_confirm(&self, locked: &mut Locked, ticket: ResizeTicket) {
        let id = locked.id();
        if let Err(e) = self.inner.driver.destroy(&ticket.old_guest).await {
            warn!(server_id = %id, guest_id = %ticket.old_guest, error = %e, "failed to destroy pre-resize guest");
        }
        self.inner.tracker.promote(id);
        locked.record.server.pending_resize = None;

        info!(server_id = %id, old_flavor = %ticket.old_flavor.name, "resize confirmed");
        locked.settle(ServerState::Active);
    }

    fn spawn_auto_confirm(&self, id: Uuid, resize_id: Uuid, window: Duration) -> AbortHandle {
        let svc = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            svc.auto_confirm(id, resize_id).await;
        })
        .abort_handle()
    }

    async fn auto_confirm(&self, id: Uuid, resize_id: Uuid) {
        let Ok(mut locked) = self.lock(id).await else {
            debug!(server_id = %id, "server deleted before resize auto-confirm");
            return;
        };

        let ticket = match locked.record.resize.take() {
            Some(ticket) if ticket.id == resize_id => ticket,
            other => {
                locked.record.resize = other;
                debug!(server_id = %id, %resize_id, "resize already settled, auto-confirm skipped");
                return;
            }
        };

        info!(server_id = %id, "confirm window elapsed");
        self.apply_confirm(&mut locked, ticket).await;
    }
}

fn take_ticket(locked: &mut Locked, operation: Operation) -> Result<ResizeTicket> {
    let state = locked.server().state;
    locked
        .record
        .resize
        .take()
        .ok_or(Error::InvalidStateTransition { state, operation })
}
