use std::sync::Arc;

use nimbus_compute::ComputeService;

use crate::capabilities::ResponseCache;
use crate::config::ProviderCapabilities;

#[derive(Clone)]
pub struct AppState {
    pub compute: ComputeService,
    pub capabilities: Arc<ProviderCapabilities>,
    pub cache: ResponseCache,
}

impl AppState {
    pub fn new(compute: ComputeService, capabilities: ProviderCapabilities) -> Self {
        Self {
            compute,
            capabilities: Arc::new(capabilities),
            cache: ResponseCache::default(),
        }
    }
}
