use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use nimbus_infra::types::checksum;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{DEFAULT_CPU_SHARES, Flavor, Image, ImageKind, NewFlavor, NewImage};
use crate::{Error, Result};

/// Operator-provided flavors and images loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub flavors: Vec<NewFlavor>,
    #[serde(default)]
    pub images: Vec<NewImage>,
}

impl CatalogSeed {
    pub fn builtin() -> Self {
        let flavor = |name: &str, vcpus, memory_mb, disk_gb| NewFlavor {
            name: name.into(),
            vcpus,
            memory_mb,
            disk_gb,
            cpu_shares: None,
        };
        let image = |name: &str, min_ram_mb, min_disk_gb| NewImage {
            name: name.into(),
            checksum: None,
            min_ram_mb,
            min_disk_gb,
        };

        Self {
            flavors: vec![
                flavor("m1.tiny", 1, 512, 1),
                flavor("m1.small", 1, 2048, 20),
                flavor("m1.medium", 2, 4096, 40),
                flavor("m1.large", 4, 8192, 80),
                flavor("m1.xlarge", 8, 16384, 160),
            ],
            images: vec![
                image("cirros-0.6", 64, 1),
                image("debian-12", 512, 2),
                image("ubuntu-24.04", 1024, 10),
            ],
        }
    }
}

/// Flavors and images known to the control plane.
#[derive(Default)]
pub struct Catalog {
    flavors: RwLock<HashMap<Uuid, Flavor>>,
    images: RwLock<HashMap<Uuid, Image>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Result<Self> {
        let catalog = Self::new();
        for flavor in seed.flavors {
            catalog.create_flavor(flavor)?;
        }
        for image in seed.images {
            catalog.register_image(image);
        }
        Ok(catalog)
    }

    // ── Flavors ─────────────────────────────────────────────────────

    pub fn create_flavor(&self, new: NewFlavor) -> Result<Flavor> {
        let mut flavors = self.flavors.write().unwrap_or_else(PoisonError::into_inner);
        if flavors.values().any(|f| f.name == new.name) {
            return Err(Error::DuplicateFlavor(new.name));
        }

        let flavor = Flavor {
            id: Uuid::new_v4(),
            name: new.name,
            vcpus: new.vcpus,
            memory_mb: new.memory_mb,
            disk_gb: new.disk_gb,
            cpu_shares: new.cpu_shares.unwrap_or(DEFAULT_CPU_SHARES),
            created_at: Utc::now(),
        };
        flavors.insert(flavor.id, flavor.clone());
        Ok(flavor)
    }

    pub fn get_flavor(&self, id: Uuid) -> Result<Flavor> {
        self.flavors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::FlavorNotFound(id))
    }

    /// Flavors ordered smallest first.
    pub fn list_flavors(&self) -> Vec<Flavor> {
        let mut flavors: Vec<Flavor> = self
            .flavors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        flavors.sort_by(|a, b| {
            (a.vcpus, a.memory_mb, a.disk_gb, &a.name).cmp(&(b.vcpus, b.memory_mb, b.disk_gb, &b.name))
        });
        flavors
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Register an operator image.
    pub fn register_image(&self, new: NewImage) -> Image {
        let id = Uuid::new_v4();
        let checksum = new
            .checksum
            .unwrap_or_else(|| checksum(&[new.name.as_bytes(), id.as_bytes()]));
        self.insert_image(Image {
            id,
            name: new.name,
            kind: ImageKind::Operator,
            checksum,
            min_ram_mb: new.min_ram_mb,
            min_disk_gb: new.min_disk_gb,
            created_at: Utc::now(),
        })
    }

    /// Register an image captured from a server's disk.
    pub fn register_custom_image(
        &self,
        name: String,
        source_server: Uuid,
        checksum: String,
        min_ram_mb: u64,
        min_disk_gb: u64,
    ) -> Image {
        self.insert_image(Image {
            id: Uuid::new_v4(),
            name,
            kind: ImageKind::Custom { source_server },
            checksum,
            min_ram_mb,
            min_disk_gb,
            created_at: Utc::now(),
        })
    }

    pub fn get_image(&self, id: Uuid) -> Result<Image> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::ImageNotFound(id))
    }

    pub fn list_images(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self
            .images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        images.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        images
    }

    /// Delete a custom image. Operator images are read-only.
    pub fn delete_image(&self, id: Uuid) -> Result<()> {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        let image = images.get(&id).ok_or(Error::ImageNotFound(id))?;
        if image.is_read_only() {
            return Err(Error::ImageReadOnly(id));
        }
        images.remove(&id);
        Ok(())
    }

    fn insert_image(&self, image: Image) -> Image {
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.id, image.clone());
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_seed_loads() {
        let catalog = Catalog::from_seed(CatalogSeed::builtin()).unwrap();
        let flavors = catalog.list_flavors();
        assert_eq!(flavors.len(), 5);
        assert_eq!(flavors[0].name, "m1.tiny");
        assert_eq!(flavors[0].cpu_shares, DEFAULT_CPU_SHARES);
        assert_eq!(catalog.list_images().len(), 3);
    }

    #[test]
    fn flavor_names_are_unique() {
        let catalog = Catalog::new();
        let new = NewFlavor {
            name: "m1.tiny".into(),
            vcpus: 1,
            memory_mb: 512,
            disk_gb: 1,
            cpu_shares: Some(512),
        };
        let flavor = catalog.create_flavor(new.clone()).unwrap();
        assert_eq!(flavor.cpu_shares, 512);
        assert!(matches!(
            catalog.create_flavor(new),
            Err(Error::DuplicateFlavor(name)) if name == "m1.tiny"
        ));
    }

    #[test]
    fn operator_images_are_read_only() {
        let catalog = Catalog::new();
        let image = catalog.register_image(NewImage {
            name: "debian".into(),
            checksum: Some("sum".into()),
            min_ram_mb: 0,
            min_disk_gb: 0,
        });
        assert_eq!(image.checksum, "sum");
        assert!(matches!(catalog.delete_image(image.id), Err(Error::ImageReadOnly(_))));

        let custom =
            catalog.register_custom_image("snap".into(), Uuid::new_v4(), "c".into(), 0, 1);
        catalog.delete_image(custom.id).unwrap();
        assert!(matches!(catalog.get_image(custom.id), Err(Error::ImageNotFound(_))));
    }

    #[test]
    fn seed_parses_from_json() {
        let seed: CatalogSeed = serde_json::from_str(
            r#"{"flavors": [{"name": "c1", "vcpus": 2, "memory_mb": 1024, "disk_gb": 10}]}"#,
        )
        .unwrap();
        assert_eq!(seed.flavors.len(), 1);
        assert!(seed.images.is_empty());
    }
}
