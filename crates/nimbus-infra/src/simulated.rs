use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{
    DiskContents, DiskSnapshot, GuestId, GuestInfo, GuestShape, GuestSpec, ImageSource, PowerState,
};
use crate::{Error, Result, VirtDriver};

struct Guest {
    server_id: Uuid,
    name: String,
    shape: GuestShape,
    power_state: PowerState,
    disk: DiskContents,
    addresses: Vec<Ipv4Addr>,
    acpi_responsive: bool,
}

impl Guest {
    fn info(&self, id: &GuestId) -> GuestInfo {
        GuestInfo {
            id: id.clone(),
            server_id: self.server_id,
            power_state: self.power_state,
            shape: self.shape,
        }
    }
}

/// In-process driver that models guest power state and disk contents.
///
/// Used as the default backend of the service and as the driver double in
/// tests. Guests live only as long as the driver.
#[derive(Default)]
pub struct SimulatedDriver {
    guests: Mutex<HashMap<GuestId, Guest>>,
    latency: Duration,
    fail_next: AtomicBool,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every guest operation sleeps for `latency` before completing.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Whether the guest acknowledges graceful shutdown signals.
    pub fn set_acpi_responsive(&self, id: &GuestId, responsive: bool) -> Result<()> {
        self.with_guest(id, |g| {
            g.acpi_responsive = responsive;
            Ok(())
        })
    }

    /// Move the underlying VM to `state` behind the control plane's back.
    pub fn force_power_state(&self, id: &GuestId, state: PowerState) -> Result<()> {
        self.with_guest(id, |g| {
            g.power_state = state;
            Ok(())
        })
    }

    /// Record a file written by the guest onto its disk.
    pub fn write_file(&self, id: &GuestId, path: &str) -> Result<()> {
        self.with_guest(id, |g| {
            g.disk.files.insert(path.to_string());
            Ok(())
        })
    }

    pub fn disk(&self, id: &GuestId) -> Result<DiskContents> {
        self.with_guest(id, |g| Ok(g.disk.clone()))
    }

    pub fn addresses(&self, id: &GuestId) -> Result<Vec<Ipv4Addr>> {
        self.with_guest(id, |g| Ok(g.addresses.clone()))
    }

    pub fn guest_count(&self) -> usize {
        self.guests().len()
    }

    /// Make the next mutating guest operation fail.
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn guests(&self) -> MutexGuard<'_, HashMap<GuestId, Guest>> {
        self.guests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_guest<T>(&self, id: &GuestId, f: impl FnOnce(&mut Guest) -> Result<T>) -> Result<T> {
        let mut guests = self.guests();
        let guest = guests
            .get_mut(id)
            .ok_or_else(|| Error::GuestNotFound(id.clone()))?;
        f(guest)
    }

    /// Apply a power transition if the guest is in one of `from`.
    fn transition(
        &self,
        id: &GuestId,
        from: &[PowerState],
        to: PowerState,
        action: &'static str,
    ) -> Result<()> {
        self.with_guest(id, |g| {
            if !from.contains(&g.power_state) {
                return Err(Error::InvalidPowerState {
                    id: id.clone(),
                    state: g.power_state,
                    action,
                });
            }
            g.power_state = to;
            Ok(())
        })
    }

    async fn begin(&self, action: &'static str) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            warn!(action, "simulated: injected failure");
            return Err(Error::Driver(format!("{action}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl VirtDriver for SimulatedDriver {
    async fn spawn(&self, spec: &GuestSpec) -> Result<GuestInfo> {
        self.begin("spawn").await?;

        let id = GuestId(format!("sim-{}", Uuid::new_v4().simple()));
        let guest = Guest {
            server_id: spec.server_id,
            name: spec.name.clone(),
            shape: spec.shape,
            power_state: PowerState::Running,
            disk: DiskContents::from_image(&spec.image),
            addresses: spec.addresses.clone(),
            acpi_responsive: true,
        };
        let info = guest.info(&id);
        self.guests().insert(id.clone(), guest);

        info!(guest_id = %id, name = %spec.name, "simulated: guest spawned");
        Ok(info)
    }

    async fn soft_reboot(&self, id: &GuestId) -> Result<()> {
        let responsive = self.with_guest(id, |g| {
            if g.power_state != PowerState::Running {
                return Err(Error::InvalidPowerState {
                    id: id.clone(),
                    state: g.power_state,
                    action: "soft reboot",
                });
            }
            Ok(g.acpi_responsive)
        })?;

        if !responsive {
            debug!(guest_id = %id, "simulated: guest ignored shutdown signal");
            std::future::pending::<()>().await;
        }

        self.begin("soft reboot").await?;
        self.transition(id, &[PowerState::Running], PowerState::Running, "soft reboot")
    }

    async fn hard_reboot(&self, id: &GuestId) -> Result<()> {
        self.begin("hard reboot").await?;
        self.with_guest(id, |g| {
            g.power_state = PowerState::Running;
            Ok(())
        })?;

        info!(guest_id = %id, "simulated: guest power-cycled");
        Ok(())
    }

    async fn rebuild(&self, id: &GuestId, image: &ImageSource) -> Result<()> {
        self.begin("rebuild").await?;
        self.with_guest(id, |g| {
            g.disk = DiskContents::from_image(image);
            g.power_state = PowerState::Running;
            Ok(())
        })?;

        info!(guest_id = %id, image_id = %image.image_id, "simulated: guest rebuilt");
        Ok(())
    }

    async fn migrate(&self, id: &GuestId, shape: &GuestShape) -> Result<GuestInfo> {
        self.begin("migrate").await?;

        let new_id = GuestId(format!("sim-{}", Uuid::new_v4().simple()));
        let mut guests = self.guests();
        let source = guests
            .get_mut(id)
            .ok_or_else(|| Error::GuestNotFound(id.clone()))?;
        source.power_state = PowerState::Shutdown;

        let target = Guest {
            server_id: source.server_id,
            name: source.name.clone(),
            shape: *shape,
            power_state: PowerState::Running,
            disk: source.disk.clone(),
            addresses: source.addresses.clone(),
            acpi_responsive: source.acpi_responsive,
        };
        let info = target.info(&new_id);
        guests.insert(new_id.clone(), target);

        info!(source = %id, target = %new_id, "simulated: guest migrated");
        Ok(info)
    }

    async fn pause(&self, id: &GuestId) -> Result<()> {
        self.begin("pause").await?;
        self.transition(id, &[PowerState::Running], PowerState::Paused, "pause")
    }

    async fn unpause(&self, id: &GuestId) -> Result<()> {
        self.begin("unpause").await?;
        self.transition(id, &[PowerState::Paused], PowerState::Running, "unpause")
    }

    async fn suspend(&self, id: &GuestId) -> Result<()> {
        self.begin("suspend").await?;
        self.transition(
            id,
            &[PowerState::Running, PowerState::Paused],
            PowerState::Suspended,
            "suspend",
        )
    }

    async fn resume(&self, id: &GuestId) -> Result<()> {
        self.begin("resume").await?;
        self.transition(id, &[PowerState::Suspended], PowerState::Running, "resume")
    }

    async fn power_off(&self, id: &GuestId) -> Result<()> {
        self.begin("power off").await?;
        self.with_guest(id, |g| {
            g.power_state = PowerState::Shutdown;
            Ok(())
        })
    }

    async fn power_on(&self, id: &GuestId) -> Result<()> {
        self.begin("power on").await?;
        self.transition(
            id,
            &[PowerState::Shutdown, PowerState::Running],
            PowerState::Running,
            "power on",
        )
    }

    async fn snapshot(&self, id: &GuestId) -> Result<DiskSnapshot> {
        self.begin("snapshot").await?;
        self.with_guest(id, |g| {
            Ok(DiskSnapshot {
                checksum: g.disk.checksum(),
            })
        })
    }

    async fn destroy(&self, id: &GuestId) -> Result<()> {
        self.begin("destroy").await?;
        if self.guests().remove(id).is_none() {
            warn!(guest_id = %id, "simulated: guest already destroyed");
            return Ok(());
        }

        info!(guest_id = %id, "simulated: guest destroyed");
        Ok(())
    }

    async fn get_guest(&self, id: &GuestId) -> Result<GuestInfo> {
        self.with_guest(id, |g| Ok(g.info(id)))
    }

    async fn list_guests(&self) -> Result<Vec<GuestInfo>> {
        let mut guests: Vec<GuestInfo> = self
            .guests()
            .iter()
            .map(|(id, g)| g.info(id))
            .collect();
        guests.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(guests)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
