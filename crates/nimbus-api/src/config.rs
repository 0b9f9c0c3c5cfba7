use std::env;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;
use ipnet::Ipv4Net;
use nimbus_compute::LifecycleConfig;
use nimbus_compute::catalog::CatalogSeed;
use nimbus_compute::tracker::HostCapacity;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub address_pool: Ipv4Net,
    pub soft_reboot_timeout_secs: u64,
    pub resize_confirm_window_secs: u64,
    /// Period of the orphaned guest audit.
    pub audit_interval_secs: NonZeroU64,
    pub host: HostCapacity,
    pub capabilities: ProviderCapabilities,
    pub catalog_path: Option<PathBuf>,
}

/// Optional HTTP behaviors the API advertises to clients.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    /// Strong ETags on GET responses, 304 on a matching `If-None-Match`.
    pub supports_etag: bool,
    /// Answer catalog reads served from the response cache with 203.
    pub supports_cache_203: bool,
    /// Redirect image file downloads to `image_store_url`.
    pub supports_redirect: bool,
    pub image_store_url: Option<String>,
    /// Correlation header echoed or generated on every response.
    pub request_id_header: HeaderName,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_etag: true,
            supports_cache_203: true,
            supports_redirect: false,
            image_store_url: None,
            request_id_header: HeaderName::from_static("x-compute-request-id"),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = HostCapacity::default();
        Self {
            listen_addr: var_or("LISTEN_ADDR", "0.0.0.0:8774"),
            address_pool: var_or("ADDRESS_POOL", "10.0.0.0/24"),
            soft_reboot_timeout_secs: var_or("SOFT_REBOOT_TIMEOUT_SECS", "60"),
            resize_confirm_window_secs: var_or("RESIZE_CONFIRM_WINDOW_SECS", "86400"),
            audit_interval_secs: var_or("AUDIT_INTERVAL_SECS", "60"),
            host: HostCapacity {
                vcpus: var_or("HOST_VCPUS", &defaults.vcpus.to_string()),
                memory_mb: var_or("HOST_MEMORY_MB", &defaults.memory_mb.to_string()),
                disk_gb: var_or("HOST_DISK_GB", &defaults.disk_gb.to_string()),
                cpu_allocation_ratio: ratio_or("CPU_ALLOCATION_RATIO", defaults.cpu_allocation_ratio),
                ram_allocation_ratio: ratio_or("RAM_ALLOCATION_RATIO", defaults.ram_allocation_ratio),
            },
            capabilities: ProviderCapabilities {
                supports_etag: var_or("SUPPORTS_ETAG", "true"),
                supports_cache_203: var_or("SUPPORTS_CACHE_203", "true"),
                supports_redirect: var_or("SUPPORTS_REDIRECT", "false"),
                image_store_url: env::var("IMAGE_STORE_URL").ok(),
                request_id_header: var_or("REQUEST_ID_HEADER", "x-compute-request-id"),
            },
            catalog_path: env::var("CATALOG_PATH").ok().map(PathBuf::from),
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            soft_reboot_timeout: Duration::from_secs(self.soft_reboot_timeout_secs),
            resize_confirm_window: Duration::from_secs(self.resize_confirm_window_secs),
        }
    }

    /// Flavors and images to start with: `CATALOG_PATH` if set, else the
    /// built-in set.
    pub fn catalog_seed(&self) -> CatalogSeed {
        let Some(path) = &self.catalog_path else {
            return CatalogSeed::builtin();
        };
        let raw = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("failed to read CATALOG_PATH {}: {e}", path.display()));
        serde_json::from_str(&raw)
            .unwrap_or_else(|e| panic!("CATALOG_PATH {} is not a valid catalog: {e}", path.display()))
    }
}

fn var_or<T>(key: &str, default: &str) -> T
where
    T: FromStr,
    T::Err: Debug,
{
    env::var(key)
        .unwrap_or_else(|_| default.into())
        .parse()
        .unwrap_or_else(|e| panic!("{key} is invalid: {e:?}"))
}

fn ratio_or(key: &str, default: f64) -> f64 {
    check_ratio(key, var_or(key, &default.to_string()))
}

/// Allocation ratios scale host capacity and must be positive.
fn check_ratio(key: &str, ratio: f64) -> f64 {
    if !ratio.is_finite() || ratio <= 0.0 {
        panic!("{key} must be a positive number, got {ratio}");
    }
    ratio
}
