//! Metrics for container startup and asset provisioning
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host process installs a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub struct ResourceMetrics;

impl ResourceMetrics {
    /// Register metric descriptions (call once after installing a recorder)
    pub fn describe() {
        describe_counter!(
            "test_resources_containers_started_total",
            "Containers started by service"
        );
        describe_histogram!(
            "test_resources_startup_duration_seconds",
            "Time from start request to readiness"
        );
        describe_counter!(
            "test_resources_containers_reused_total",
            "start_if_needed calls answered by a running instance"
        );
        describe_counter!(
            "test_resources_assets_fetched_total",
            "Asset fetches by service and status"
        );
        describe_histogram!(
            "test_resources_asset_fetch_duration_seconds",
            "Asset fetch duration"
        );
    }

    pub fn container_started(service: &str, duration: Duration) {
        counter!("test_resources_containers_started_total", "service" => service.to_string())
            .increment(1);
        histogram!("test_resources_startup_duration_seconds", "service" => service.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn container_reused(service: &str) {
        counter!("test_resources_containers_reused_total", "service" => service.to_string())
            .increment(1);
    }

    pub fn asset_fetched(service: &str, duration: Duration) {
        counter!(
            "test_resources_assets_fetched_total",
            "service" => service.to_string(),
            "status" => "success"
        )
        .increment(1);
        histogram!("test_resources_asset_fetch_duration_seconds", "service" => service.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn asset_fetch_failed(service: &str) {
        counter!(
            "test_resources_assets_fetched_total",
            "service" => service.to_string(),
            "status" => "failed"
        )
        .increment(1);
    }
}
