use std::time::Duration;

use nimbus_compute::ComputeService;
use tokio::task::JoinHandle;

/// Spawn the background audit that destroys guests no server owns.
pub fn spawn_audit(compute: ComputeService, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = compute.audit().await {
                tracing::error!(error = %e, "guest audit failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::ProviderCapabilities;
    use crate::test_support::TestApp;

    #[tokio::test(start_paused = true)]
    async fn audit_runs_periodically() {
        let app = TestApp::new(ProviderCapabilities::default());
        let audit = spawn_audit(app.compute.clone(), 60);

        let server = app.create_server().await;
        let id = Uuid::parse_str(server["id"].as_str().unwrap()).unwrap();

        // The guest survives a failed destroy on delete.
        app.driver.fail_next_call();
        app.compute.delete(id).await.unwrap();
        assert_eq!(app.driver.guest_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(app.driver.guest_count(), 0);

        audit.abort();
    }
}
