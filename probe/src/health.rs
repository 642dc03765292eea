use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::warn;

/// Liveness reporting for the probe's long-running loops.
///
/// The process can only be trusted with a test queue if the scheduler loop
/// is actually dequeuing messages, so the loop reports in periodically and
/// the `/_liveness` endpoint fails once any registered component misses its
/// deadline.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub async fn report_healthy(&self) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().add(self.deadline),
            ),
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned mutex: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry mutex");
                }
            }
        });

        registry
    }

    /// Registers a component and returns the handle it reports through.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        let message = HealthMessage {
            component: component.to_owned(),
            status: ComponentStatus::Starting,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to register health component: {}", err);
        }
        handle
    }

    /// Overall process status; usable as an axum handler return value.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");
        let now = time::OffsetDateTime::now_utc();

        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), other.clone());
                }
            }
        }
        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn wait_for<F>(check: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..50 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check());
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_reports_drive_status() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("scheduler", Duration::from_secs(30)).await;

        // Newly registered components hold the check red until they report
        wait_for(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        wait_for(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stale_component_goes_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("scheduler", Duration::from_secs(30)).await;
        handle.report_healthy().await;
        wait_for(|| registry.get_status().healthy).await;

        // A report whose deadline already passed flips the check red
        let message = HealthMessage {
            component: "scheduler".to_string(),
            status: ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().sub(Duration::from_secs(1)),
            ),
        };
        handle.sender.send(message).await.expect("send failed");
        wait_for(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("scheduler"),
            Some(&ComponentStatus::Stalled)
        );
    }
}
