use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use nimbus_infra::VirtDriver;
use nimbus_infra::types::{GuestId, GuestSpec};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::addresses::AddressPool;
use crate::catalog::Catalog;
use crate::lifecycle::{self, Operation};
use crate::models::{Flavor, Image, RebootKind, Server, ServerState};
use crate::tracker::{ClaimKind, ResourceTracker, Usage};
use crate::{Error, Result};

/// Timing bounds for lifecycle operations.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// How long a guest gets to acknowledge a graceful reboot before it is
    /// power-cycled.
    pub soft_reboot_timeout: Duration,
    /// How long a resize waits for confirm or revert before it is confirmed
    /// automatically.
    pub resize_confirm_window: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            soft_reboot_timeout: Duration::from_secs(60),
            resize_confirm_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateServer {
    pub name: String,
    pub flavor_id: Uuid,
    pub image_id: Uuid,
}

/// State behind a server's lock.
pub(crate) struct ServerRecord {
    pub(crate) server: Server,
    pub(crate) resize: Option<ResizeTicket>,
    /// Set by delete. A caller that found the slot before it was removed
    /// sees the server as gone.
    pub(crate) deleted: bool,
}

/// Bookkeeping for a resize awaiting confirmation.
pub(crate) struct ResizeTicket {
    pub(crate) id: Uuid,
    pub(crate) old_flavor: Flavor,
    pub(crate) old_guest: GuestId,
    pub(crate) timer: AbortHandle,
}

pub(crate) struct ServerSlot {
    pub(crate) record: Arc<Mutex<ServerRecord>>,
    published: watch::Sender<Server>,
}

/// Exclusive access to one server for the duration of an operation.
pub(crate) struct Locked {
    slot: Arc<ServerSlot>,
    pub(crate) record: OwnedMutexGuard<ServerRecord>,
}

impl Locked {
    pub(crate) fn id(&self) -> Uuid {
        self.record.server.id
    }

    pub(crate) fn server(&self) -> &Server {
        &self.record.server
    }

    pub(crate) fn snapshot(&self) -> Server {
        self.record.server.clone()
    }

    /// The guest backing this server. A server whose build failed has none.
    pub(crate) fn guest(&self, operation: Operation) -> Result<GuestId> {
        self.record
            .server
            .guest_id
            .clone()
            .ok_or(Error::InvalidStateTransition {
                state: self.record.server.state,
                operation,
            })
    }

    pub(crate) fn publish(&mut self) {
        self.record.server.updated_at = Utc::now();
        self.slot.published.send_replace(self.record.server.clone());
    }

    /// Enter an in-flight state.
    pub(crate) fn set_state(&mut self, state: ServerState) {
        self.record.server.state = state;
        self.publish();
    }

    /// Finish an operation successfully.
    pub(crate) fn settle(&mut self, state: ServerState) {
        info!(server_id = %self.id(), state = %state, "server settled");
        self.record.server.fault = None;
        self.set_state(state);
    }

    /// Finish an operation that did not go as requested.
    pub(crate) fn settle_with_fault(&mut self, state: ServerState, fault: String) {
        self.record.server.fault = Some(fault);
        self.set_state(state);
    }

    /// Record a driver failure of a synchronous operation; state is unchanged.
    fn fault(&mut self, e: nimbus_infra::Error) -> Error {
        error!(server_id = %self.id(), error = %e, "driver operation failed");
        self.record.server.fault = Some(e.to_string());
        self.publish();
        Error::Driver(e)
    }
}

pub(crate) struct Inner {
    pub(crate) catalog: Catalog,
    servers: RwLock<HashMap<Uuid, Arc<ServerSlot>>>,
    pub(crate) driver: Arc<dyn VirtDriver>,
    pub(crate) tracker: ResourceTracker,
    addresses: AddressPool,
    pub(crate) config: LifecycleConfig,
}

/// Runs server lifecycle operations.
///
/// Each server admits one operation at a time; a request that finds an
/// operation in flight fails with [`Error::ServerBusy`]. Long operations
/// return as soon as the server enters its in-flight state and settle in the
/// background.
#[derive(Clone)]
pub struct ComputeService {
    pub(crate) inner: Arc<Inner>,
}

impl ComputeService {
    pub fn new(
        catalog: Catalog,
        driver: Arc<dyn VirtDriver>,
        tracker: ResourceTracker,
        addresses: AddressPool,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                servers: RwLock::new(HashMap::new()),
                driver,
                tracker,
                addresses,
                config,
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn usage(&self) -> Usage {
        self.inner.tracker.usage()
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.inner.tracker
    }

    pub fn config(&self) -> LifecycleConfig {
        self.inner.config
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: Uuid) -> Result<Server> {
        Ok(self.slot(id)?.published.borrow().clone())
    }

    pub fn list(&self) -> Vec<Server> {
        let mut servers: Vec<Server> = self
            .servers()
            .values()
            .map(|slot| slot.published.borrow().clone())
            .collect();
        servers.sort_by_key(|s| (s.created_at, s.id));
        servers
    }

    /// Follow state changes of one server.
    pub fn subscribe(&self, id: Uuid) -> Result<watch::Receiver<Server>> {
        Ok(self.slot(id)?.published.subscribe())
    }

    /// Wait until the server reaches `state`.
    pub async fn wait_for_state(&self, id: Uuid, state: ServerState) -> Result<Server> {
        let mut rx = self.subscribe(id)?;
        let server = rx
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| Error::ServerNotFound(id))?
            .clone();
        Ok(server)
    }

    // ── Create / delete ─────────────────────────────────────────────

    /// Claim resources and an address, then build the guest in the
    /// background. The returned server is in `BUILD`.
    pub fn create(&self, req: CreateServer) -> Result<Server> {
        let flavor = self.inner.catalog.get_flavor(req.flavor_id)?;
        let image = self.inner.catalog.get_image(req.image_id)?;
        image.check_compatible(&flavor)?;

        let id = Uuid::new_v4();
        self.inner
            .tracker
            .claim(id, ClaimKind::Instance, flavor.resources())?;
        let address = match self.inner.addresses.allocate() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.tracker.release_server(id);
                return Err(e);
            }
        };

        let now = Utc::now();
        let server = Server {
            id,
            name: req.name,
            state: ServerState::Building,
            flavor_id: flavor.id,
            image_id: image.id,
            addresses: vec![address],
            fault: None,
            pending_resize: None,
            guest_id: None,
            created_at: now,
            updated_at: now,
        };

        let (published, _) = watch::channel(server.clone());
        let slot = Arc::new(ServerSlot {
            record: Arc::new(Mutex::new(ServerRecord {
                server: server.clone(),
                resize: None,
                deleted: false,
            })),
            published,
        });
        let record = slot
            .record
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::ServerBusy(id))?;
        self.servers_mut().insert(id, slot.clone());

        info!(server_id = %id, flavor = %flavor.name, image = %image.name, "building server");

        let svc = self.clone();
        let locked = Locked { slot, record };
        tokio::spawn(async move { svc.finish_build(locked, flavor, image).await });

        Ok(server)
    }

    async fn finish_build(&self, mut locked: Locked, flavor: Flavor, image: Image) {
        let spec = GuestSpec {
            server_id: locked.id(),
            name: locked.server().name.clone(),
            shape: flavor.shape(),
            image: image.source(),
            addresses: locked.server().addresses.clone(),
        };

        match self.inner.driver.spawn(&spec).await {
            Ok(info) => {
                locked.record.server.guest_id = Some(info.id);
                locked.settle(ServerState::Active);
            }
            Err(e) => {
                error!(server_id = %locked.id(), error = %e, "failed to build server");
                self.inner.tracker.release_server(locked.id());
                locked.settle_with_fault(ServerState::Error, format!("build failed: {e}"));
            }
        }
    }

    /// Tear down every guest the server owns and give back its claims and
    /// addresses.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut locked = self.begin(id, Operation::Delete)?;

        // Best-effort destroy; the record goes away regardless and the audit
        // picks up guests left behind.
        if let Some(ticket) = locked.record.resize.take() {
            ticket.timer.abort();
            if let Err(e) = self.inner.driver.destroy(&ticket.old_guest).await {
                warn!(server_id = %id, error = %e, "failed to destroy pre-resize guest");
            }
        }
        if let Some(guest) = locked.record.server.guest_id.take() {
            if let Err(e) = self.inner.driver.destroy(&guest).await {
                warn!(server_id = %id, error = %e, "failed to destroy guest");
            }
        }

        self.inner.tracker.release_server(id);
        for addr in std::mem::take(&mut locked.record.server.addresses) {
            self.inner.addresses.release(addr);
        }
        locked.record.deleted = true;
        self.servers_mut().remove(&id);

        info!(server_id = %id, "server deleted");
        Ok(())
    }

    // ── Reboot ──────────────────────────────────────────────────────

    pub fn reboot(&self, id: Uuid, kind: RebootKind) -> Result<Server> {
        let operation = Operation::reboot(kind);
        let mut locked = self.begin(id, operation)?;
        let guest = locked.guest(operation)?;

        locked.set_state(ServerState::Rebooting(kind));
        let server = locked.snapshot();

        let svc = self.clone();
        tokio::spawn(async move { svc.finish_reboot(locked, guest, kind).await });
        Ok(server)
    }

    async fn finish_reboot(&self, mut locked: Locked, guest: GuestId, kind: RebootKind) {
        let id = locked.id();

        if kind == RebootKind::Soft {
            let timeout = self.inner.config.soft_reboot_timeout;
            match tokio::time::timeout(timeout, self.inner.driver.soft_reboot(&guest)).await {
                Ok(Ok(())) => {
                    locked.settle(ServerState::Active);
                    return;
                }
                Ok(Err(e)) => {
                    warn!(server_id = %id, error = %e, "soft reboot failed, escalating to hard reboot");
                }
                Err(_) => {
                    warn!(
                        server_id = %id,
                        timeout_secs = timeout.as_secs(),
                        "guest did not acknowledge shutdown, escalating to hard reboot"
                    );
                }
            }
            locked.set_state(ServerState::Rebooting(RebootKind::Hard));
        }

        match self.inner.driver.hard_reboot(&guest).await {
            Ok(()) => locked.settle(ServerState::Active),
            Err(e) => {
                error!(server_id = %id, error = %e, "hard reboot failed");
                locked.settle_with_fault(ServerState::Error, format!("hard reboot failed: {e}"));
            }
        }
    }

    // ── Rebuild ─────────────────────────────────────────────────────

    /// Replace the server's disk with `image_id`, keeping its id and
    /// addresses.
    pub fn rebuild(&self, id: Uuid, image_id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Rebuild)?;
        let image = self.inner.catalog.get_image(image_id)?;
        let flavor = self.inner.catalog.get_flavor(locked.server().flavor_id)?;
        image.check_compatible(&flavor)?;
        let guest = locked.guest(Operation::Rebuild)?;

        locked.set_state(ServerState::Rebuilding);
        let server = locked.snapshot();

        let svc = self.clone();
        tokio::spawn(async move { svc.finish_rebuild(locked, guest, image).await });
        Ok(server)
    }

    async fn finish_rebuild(&self, mut locked: Locked, guest: GuestId, image: Image) {
        match self.inner.driver.rebuild(&guest, &image.source()).await {
            Ok(()) => {
                locked.record.server.image_id = image.id;
                locked.settle(ServerState::Active);
            }
            Err(e) => {
                error!(server_id = %locked.id(), error = %e, "rebuild failed");
                locked.settle_with_fault(ServerState::Error, format!("rebuild failed: {e}"));
            }
        }
    }

    // ── Pause / suspend / stop ──────────────────────────────────────

    /// Freeze the guest in memory. Its resources stay claimed.
    pub async fn pause(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Pause)?;
        let guest = locked.guest(Operation::Pause)?;
        if let Err(e) = self.inner.driver.pause(&guest).await {
            return Err(locked.fault(e));
        }
        locked.settle(ServerState::Paused);
        Ok(locked.snapshot())
    }

    pub async fn unpause(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Unpause)?;
        let guest = locked.guest(Operation::Unpause)?;
        if let Err(e) = self.inner.driver.unpause(&guest).await {
            return Err(locked.fault(e));
        }
        locked.settle(ServerState::Active);
        Ok(locked.snapshot())
    }

    /// Save guest memory to disk and hand its vCPUs and memory back to the
    /// host.
    pub async fn suspend(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Suspend)?;
        let guest = locked.guest(Operation::Suspend)?;
        let flavor = self.inner.catalog.get_flavor(locked.server().flavor_id)?;
        if let Err(e) = self.inner.driver.suspend(&guest).await {
            return Err(locked.fault(e));
        }

        self.inner
            .tracker
            .claim(id, ClaimKind::Instance, flavor.resources().disk_only())?;
        locked.settle(ServerState::Suspended);
        Ok(locked.snapshot())
    }

    /// Reclaim vCPUs and memory and restore the guest. Fails without side
    /// effects when the host no longer has room.
    pub async fn resume(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Resume)?;
        let guest = locked.guest(Operation::Resume)?;
        let flavor = self.inner.catalog.get_flavor(locked.server().flavor_id)?;

        self.inner
            .tracker
            .claim(id, ClaimKind::Instance, flavor.resources())?;
        if let Err(e) = self.inner.driver.resume(&guest).await {
            self.inner
                .tracker
                .claim(id, ClaimKind::Instance, flavor.resources().disk_only())?;
            return Err(locked.fault(e));
        }
        locked.settle(ServerState::Active);
        Ok(locked.snapshot())
    }

    pub async fn stop(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Stop)?;
        let guest = locked.guest(Operation::Stop)?;
        if let Err(e) = self.inner.driver.power_off(&guest).await {
            return Err(locked.fault(e));
        }
        locked.settle(ServerState::Stopped);
        Ok(locked.snapshot())
    }

    pub async fn start(&self, id: Uuid) -> Result<Server> {
        let mut locked = self.begin(id, Operation::Start)?;
        let guest = locked.guest(Operation::Start)?;
        if let Err(e) = self.inner.driver.power_on(&guest).await {
            return Err(locked.fault(e));
        }
        locked.settle(ServerState::Active);
        Ok(locked.snapshot())
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Capture the server's disk as a custom image.
    pub async fn create_image(&self, id: Uuid, name: String) -> Result<Image> {
        let mut locked = self.begin(id, Operation::CreateImage)?;
        let guest = locked.guest(Operation::CreateImage)?;
        let flavor = self.inner.catalog.get_flavor(locked.server().flavor_id)?;
        let min_ram_mb = self
            .inner
            .catalog
            .get_image(locked.server().image_id)
            .map(|image| image.min_ram_mb)
            .unwrap_or(0);

        let snapshot = match self.inner.driver.snapshot(&guest).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(locked.fault(e)),
        };

        let image = self.inner.catalog.register_custom_image(
            name,
            id,
            snapshot.checksum,
            min_ram_mb,
            flavor.disk_gb,
        );
        info!(server_id = %id, image_id = %image.id, "captured server image");
        Ok(image)
    }

    /// Drop a custom image. Servers built from it are unaffected.
    pub fn delete_image(&self, image_id: Uuid) -> Result<()> {
        self.inner.catalog.delete_image(image_id)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn servers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<ServerSlot>>> {
        self.inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn servers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<ServerSlot>>> {
        self.inner
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn slot(&self, id: Uuid) -> Result<Arc<ServerSlot>> {
        self.servers()
            .get(&id)
            .cloned()
            .ok_or(Error::ServerNotFound(id))
    }

    /// Take the server for `operation`, failing if another operation holds
    /// it or the current state does not allow it.
    pub(crate) fn begin(&self, id: Uuid, operation: Operation) -> Result<Locked> {
        take_slot(id, self.slot(id)?, operation)
    }

    /// Wait for the server lock instead of failing busy. Used by internal
    /// tasks that are not client requests.
    pub(crate) async fn lock(&self, id: Uuid) -> Result<Locked> {
        let slot = self.slot(id)?;
        let record = slot.record.clone().lock_owned().await;
        if record.deleted {
            return Err(Error::ServerNotFound(id));
        }
        Ok(Locked { slot, record })
    }
}

fn take_slot(id: Uuid, slot: Arc<ServerSlot>, operation: Operation) -> Result<Locked> {
    let record = slot
        .record
        .clone()
        .try_lock_owned()
        .map_err(|_| Error::ServerBusy(id))?;
    if record.deleted {
        return Err(Error::ServerNotFound(id));
    }
    lifecycle::check_transition(id, record.server.state, operation)?;
    Ok(Locked { slot, record })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nimbus_infra::types::PowerState;

    use super::*;
    use crate::models::ImageKind;
    use crate::test_support::Fixture;
    use crate::tracker::Resources;

    #[tokio::test]
    async fn create_claims_resources_and_becomes_active() {
        let fx = Fixture::new();
        let server = fx
            .svc
            .create(CreateServer {
                name: "web-1".into(),
                flavor_id: fx.small.id,
                image_id: fx.image.id,
            })
            .unwrap();
        assert_eq!(server.state, ServerState::Building);
        assert_eq!(server.addresses.len(), 1);
        assert_eq!(fx.svc.usage().used, fx.small.resources());

        let server = fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
        assert!(server.guest_id.is_some());
        assert!(server.fault.is_none());
    }

    #[tokio::test]
    async fn create_rejects_incompatible_image() {
        let fx = Fixture::new();
        let err = fx
            .svc
            .create(CreateServer {
                name: "web-1".into(),
                flavor_id: fx.tiny.id,
                image_id: fx.big_image.id,
            })
            .unwrap_err();

        assert!(matches!(err, Error::IncompatibleImage { .. }));
        assert_eq!(fx.svc.usage().claims, 0);
        assert!(fx.svc.list().is_empty());
    }

    #[tokio::test]
    async fn failed_build_releases_claim() {
        let fx = Fixture::new();
        fx.driver.fail_next_call();
        let server = fx
            .svc
            .create(CreateServer {
                name: "web-1".into(),
                flavor_id: fx.small.id,
                image_id: fx.image.id,
            })
            .unwrap();

        let server = fx.svc.wait_for_state(server.id, ServerState::Error).await.unwrap();
        assert!(server.fault.unwrap().contains("build failed"));
        assert_eq!(fx.svc.usage().used, Resources::default());

        fx.svc.delete(server.id).await.unwrap();
        assert!(matches!(fx.svc.get(server.id), Err(Error::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn rebuild_keeps_identity_and_replaces_disk() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        let guest = server.guest_id.clone().unwrap();
        fx.driver.write_file(&guest, "/srv/data.db").unwrap();

        let rebuilding = fx.svc.rebuild(server.id, fx.other_image.id).unwrap();
        assert_eq!(rebuilding.state, ServerState::Rebuilding);

        let rebuilt = fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
        assert_eq!(rebuilt.id, server.id);
        assert_eq!(rebuilt.addresses, server.addresses);
        assert_eq!(rebuilt.image_id, fx.other_image.id);

        let disk = fx.driver.disk(rebuilt.guest_id.as_ref().unwrap()).unwrap();
        assert_eq!(disk.image_id, fx.other_image.id);
        assert_eq!(disk.image_checksum, fx.other_image.checksum);
        assert!(disk.files.is_empty());
    }

    #[tokio::test]
    async fn rebuild_rejects_missing_or_incompatible_image() {
        let fx = Fixture::new();
        let server = fx.active_server_with(fx.tiny.id, fx.image.id).await;

        let missing = Uuid::new_v4();
        assert!(matches!(
            fx.svc.rebuild(server.id, missing),
            Err(Error::ImageNotFound(id)) if id == missing
        ));
        assert!(matches!(
            fx.svc.rebuild(server.id, fx.big_image.id),
            Err(Error::IncompatibleImage { .. })
        ));
        assert_eq!(fx.svc.get(server.id).unwrap().state, ServerState::Active);
    }

    #[tokio::test]
    async fn pause_keeps_resources_suspend_releases_them() {
        let fx = Fixture::new();
        let paused = fx.active_server().await;
        let suspended = fx.active_server().await;
        let both = fx.small.resources().vcpus * 2;

        fx.svc.pause(paused.id).await.unwrap();
        assert_eq!(fx.svc.usage().used.vcpus, both);
        assert_eq!(
            fx.svc.tracker().claim_of(paused.id, ClaimKind::Instance),
            Some(fx.small.resources())
        );

        fx.svc.suspend(suspended.id).await.unwrap();
        let usage = fx.svc.usage();
        assert_eq!(usage.used.vcpus, fx.small.resources().vcpus);
        assert_eq!(usage.used.memory_mb, fx.small.memory_mb);
        assert_eq!(usage.used.disk_gb, fx.small.disk_gb * 2);
        assert_eq!(
            fx.svc.tracker().claim_of(suspended.id, ClaimKind::Instance),
            Some(fx.small.resources().disk_only())
        );
    }

    #[tokio::test]
    async fn unpause_and_resume_return_to_active() {
        let fx = Fixture::new();
        let server = fx.active_server().await;

        fx.svc.pause(server.id).await.unwrap();
        assert!(matches!(
            fx.svc.suspend(server.id).await,
            Err(Error::InvalidStateTransition { state: ServerState::Paused, .. })
        ));
        let server = fx.svc.unpause(server.id).await.unwrap();
        assert_eq!(server.state, ServerState::Active);

        fx.svc.suspend(server.id).await.unwrap();
        let server = fx.svc.resume(server.id).await.unwrap();
        assert_eq!(server.state, ServerState::Active);
        assert_eq!(fx.svc.usage().used, fx.small.resources());
    }

    #[tokio::test]
    async fn resume_fails_when_host_is_full() {
        let fx = Fixture::with_capacity(crate::tracker::HostCapacity {
            vcpus: 1,
            memory_mb: 2048,
            disk_gb: 100,
            cpu_allocation_ratio: 1.0,
            ram_allocation_ratio: 1.0,
        });
        let first = fx.active_server().await;
        fx.svc.suspend(first.id).await.unwrap();

        // The freed vCPU goes to another server.
        let second = fx.active_server().await;

        let err = fx.svc.resume(first.id).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
        assert_eq!(fx.svc.get(first.id).unwrap().state, ServerState::Suspended);

        fx.svc.delete(second.id).await.unwrap();
        fx.svc.resume(first.id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_and_start() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        let guest = server.guest_id.clone().unwrap();

        let stopped = fx.svc.stop(server.id).await.unwrap();
        assert_eq!(stopped.state, ServerState::Stopped);
        assert_eq!(fx.driver.get_guest(&guest).await.unwrap().power_state, PowerState::Shutdown);

        let started = fx.svc.start(server.id).await.unwrap();
        assert_eq!(started.state, ServerState::Active);
    }

    #[tokio::test]
    async fn hard_reboot_recovers_paused_and_stopped_guests() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        let guest = server.guest_id.clone().unwrap();

        // Underlying VM drifted while the control plane still says ACTIVE.
        for state in [PowerState::Paused, PowerState::Shutdown] {
            fx.driver.force_power_state(&guest, state).unwrap();
            fx.svc.reboot(server.id, RebootKind::Hard).unwrap();
            fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
            assert_eq!(fx.driver.get_guest(&guest).await.unwrap().power_state, PowerState::Running);
        }

        // And from the control plane's own paused and stopped states.
        fx.svc.pause(server.id).await.unwrap();
        fx.svc.reboot(server.id, RebootKind::Hard).unwrap();
        fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();

        fx.svc.stop(server.id).await.unwrap();
        fx.svc.reboot(server.id, RebootKind::Hard).unwrap();
        let server = fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
        assert_eq!(fx.driver.get_guest(&guest).await.unwrap().power_state, PowerState::Running);
        assert_eq!(fx.svc.usage().used, fx.small.resources());
        assert!(server.fault.is_none());
    }

    #[tokio::test]
    async fn soft_reboot_rejected_outside_active() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        fx.svc.pause(server.id).await.unwrap();

        let err = fx.svc.reboot(server.id, RebootKind::Soft).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                state: ServerState::Paused,
                operation: Operation::SoftReboot,
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_reboot_escalates_when_guest_ignores_signal() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        fx.driver
            .set_acpi_responsive(server.guest_id.as_ref().unwrap(), false)
            .unwrap();

        let started = tokio::time::Instant::now();
        let rebooting = fx.svc.reboot(server.id, RebootKind::Soft).unwrap();
        assert_eq!(rebooting.state, ServerState::Rebooting(RebootKind::Soft));

        let server = fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
        assert!(started.elapsed() >= fx.svc.config().soft_reboot_timeout);
        assert!(server.fault.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_operation_while_in_flight_is_busy() {
        let fx = Fixture::with_driver_latency(Duration::from_secs(5));
        let server = fx.active_server().await;

        fx.svc.reboot(server.id, RebootKind::Hard).unwrap();
        assert!(matches!(fx.svc.pause(server.id).await, Err(Error::ServerBusy(_))));
        assert!(matches!(
            fx.svc.reboot(server.id, RebootKind::Hard),
            Err(Error::ServerBusy(_))
        ));
        assert!(matches!(fx.svc.delete(server.id).await, Err(Error::ServerBusy(_))));

        // Reads are never blocked.
        let current = fx.svc.get(server.id).unwrap();
        assert_eq!(current.state, ServerState::Rebooting(RebootKind::Hard));

        fx.svc.wait_for_state(server.id, ServerState::Active).await.unwrap();
        fx.svc.pause(server.id).await.unwrap();
    }

    #[tokio::test]
    async fn create_image_captures_disk() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        fx.driver
            .write_file(server.guest_id.as_ref().unwrap(), "/etc/motd")
            .unwrap();

        let image = fx.svc.create_image(server.id, "web-snap".into()).await.unwrap();
        assert_eq!(image.kind, ImageKind::Custom { source_server: server.id });
        assert_eq!(image.min_disk_gb, fx.small.disk_gb);
        assert_eq!(image.min_ram_mb, fx.image.min_ram_mb);
        assert_ne!(image.checksum, fx.image.checksum);
        assert_eq!(fx.svc.get(server.id).unwrap().state, ServerState::Active);

        // A custom image can rebuild another server.
        let other = fx.active_server().await;
        fx.svc.rebuild(other.id, image.id).unwrap();
        let other = fx.svc.wait_for_state(other.id, ServerState::Active).await.unwrap();
        assert_eq!(other.image_id, image.id);

        fx.svc.delete_image(image.id).unwrap();
        assert_eq!(fx.svc.get(other.id).unwrap().image_id, image.id);
    }

    #[tokio::test]
    async fn delete_releases_everything() {
        let fx = Fixture::new();
        let server = fx.active_server().await;

        fx.svc.delete(server.id).await.unwrap();

        assert_eq!(fx.svc.usage().claims, 0);
        assert_eq!(fx.driver.guest_count(), 0);
        assert!(fx.svc.list().is_empty());
        assert!(matches!(fx.svc.delete(server.id).await, Err(Error::ServerNotFound(_))));

        // The address goes back to the pool.
        let next = fx.active_server().await;
        assert_eq!(next.addresses, server.addresses);
    }

    #[tokio::test]
    async fn stale_slot_after_delete_is_not_found() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        let slot = fx.svc.slot(server.id).unwrap();

        fx.svc.delete(server.id).await.unwrap();
        let reused = fx.active_server().await;
        assert_eq!(reused.addresses, server.addresses);

        // A request that looked the server up before it went away.
        assert!(matches!(
            take_slot(server.id, slot, Operation::Delete),
            Err(Error::ServerNotFound(_))
        ));
        let next = fx.active_server().await;
        assert_ne!(next.addresses, reused.addresses);
    }

    #[tokio::test]
    async fn driver_failure_on_pause_records_fault() {
        let fx = Fixture::new();
        let server = fx.active_server().await;
        fx.driver.fail_next_call();

        assert!(matches!(fx.svc.pause(server.id).await, Err(Error::Driver(_))));
        let server = fx.svc.get(server.id).unwrap();
        assert_eq!(server.state, ServerState::Active);
        assert!(server.fault.is_some());
    }
}
