use std::sync::Arc;
use std::time::Duration;

use nimbus_infra::simulated::SimulatedDriver;

use crate::addresses::AddressPool;
use crate::catalog::Catalog;
use crate::models::{Flavor, Image, NewFlavor, NewImage, Server, ServerState};
use crate::tracker::{HostCapacity, ResourceTracker};
use crate::{ComputeService, CreateServer, LifecycleConfig};

/// A service over a simulated driver with a small catalog.
pub(crate) struct Fixture {
    pub driver: Arc<SimulatedDriver>,
    pub svc: ComputeService,
    /// 1 vCPU, 512 MB, 1 GB.
    pub tiny: Flavor,
    /// 1 vCPU, 2048 MB, 20 GB.
    pub small: Flavor,
    /// 2 vCPUs, 4096 MB, 40 GB.
    pub large: Flavor,
    /// Fits every flavor.
    pub image: Image,
    pub other_image: Image,
    /// Only fits `large`.
    pub big_image: Image,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(SimulatedDriver::new(), HostCapacity::default())
    }

    pub fn with_capacity(capacity: HostCapacity) -> Self {
        Self::build(SimulatedDriver::new(), capacity)
    }

    pub fn with_driver_latency(latency: Duration) -> Self {
        Self::build(SimulatedDriver::with_latency(latency), HostCapacity::default())
    }

    fn build(driver: SimulatedDriver, capacity: HostCapacity) -> Self {
        let catalog = Catalog::new();
        let flavor = |name: &str, vcpus, memory_mb, disk_gb| {
            catalog
                .create_flavor(NewFlavor {
                    name: name.into(),
                    vcpus,
                    memory_mb,
                    disk_gb,
                    cpu_shares: None,
                })
                .unwrap()
        };
        let tiny = flavor("tiny", 1, 512, 1);
        let small = flavor("small", 1, 2048, 20);
        let large = flavor("large", 2, 4096, 40);

        let image = |name: &str, min_ram_mb, min_disk_gb| {
            catalog.register_image(NewImage {
                name: name.into(),
                checksum: None,
                min_ram_mb,
                min_disk_gb,
            })
        };
        let base = image("cirros", 256, 1);
        let other_image = image("alpine", 128, 1);
        let big_image = image("windows", 4096, 40);

        let driver = Arc::new(driver);
        let svc = ComputeService::new(
            catalog,
            driver.clone(),
            ResourceTracker::new(capacity),
            AddressPool::new("10.0.0.0/24".parse().unwrap()),
            LifecycleConfig::default(),
        );

        Self {
            driver,
            svc,
            tiny,
            small,
            large,
            image: base,
            other_image,
            big_image,
        }
    }

    /// Create a `small` server from `image` and wait for it to build.
    pub async fn active_server(&self) -> Server {
        self.active_server_with(self.small.id, self.image.id).await
    }

    pub async fn active_server_with(&self, flavor_id: uuid::Uuid, image_id: uuid::Uuid) -> Server {
        let server = self
            .svc
            .create(CreateServer {
                name: "test".into(),
                flavor_id,
                image_id,
            })
            .unwrap();
        self.svc
            .wait_for_state(server.id, ServerState::Active)
            .await
            .unwrap()
    }
}
