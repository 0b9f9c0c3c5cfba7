pub mod simulated;
pub mod types;

use async_trait::async_trait;
use types::{DiskSnapshot, GuestId, GuestInfo, GuestShape, GuestSpec, ImageSource, PowerState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest not found: {0}")]
    GuestNotFound(GuestId),

    #[error("guest {id} is {state:?}, cannot {action}")]
    InvalidPowerState {
        id: GuestId,
        state: PowerState,
        action: &'static str,
    },

    #[error("driver error: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hypervisor-facing interface for managing guests.
///
/// The control plane owns identity, addresses and resource accounting; a
/// driver only manipulates the underlying virtual machines.
#[async_trait]
pub trait VirtDriver: Send + Sync + 'static {
    /// Create and start a guest with a freshly written disk.
    async fn spawn(&self, spec: &GuestSpec) -> Result<GuestInfo>;

    /// Signal the guest OS to shut down gracefully and start it again.
    ///
    /// Resolves once the guest has acknowledged and is running. A guest that
    /// ignores the signal never resolves; callers bound this with a timeout.
    async fn soft_reboot(&self, id: &GuestId) -> Result<()>;

    /// Power-cycle the guest from whatever power state it is in.
    async fn hard_reboot(&self, id: &GuestId) -> Result<()>;

    /// Discard the guest disk and write `image` in its place.
    async fn rebuild(&self, id: &GuestId, image: &ImageSource) -> Result<()>;

    /// Build a new guest with `shape` from the disk of `id`. The source guest
    /// is left shut down so it can be restored.
    async fn migrate(&self, id: &GuestId, shape: &GuestShape) -> Result<GuestInfo>;

    async fn pause(&self, id: &GuestId) -> Result<()>;

    async fn unpause(&self, id: &GuestId) -> Result<()>;

    /// Save guest memory to disk and stop execution.
    async fn suspend(&self, id: &GuestId) -> Result<()>;

    async fn resume(&self, id: &GuestId) -> Result<()>;

    async fn power_off(&self, id: &GuestId) -> Result<()>;

    async fn power_on(&self, id: &GuestId) -> Result<()>;

    /// Capture the current disk contents.
    async fn snapshot(&self, id: &GuestId) -> Result<DiskSnapshot>;

    /// Destroy a guest permanently. Destroying a missing guest succeeds.
    async fn destroy(&self, id: &GuestId) -> Result<()>;

    async fn get_guest(&self, id: &GuestId) -> Result<GuestInfo>;

    /// Every guest the hypervisor knows about, owned or not.
    async fn list_guests(&self) -> Result<Vec<GuestInfo>>;

    /// Driver identifier.
    fn name(&self) -> &'static str;
}
