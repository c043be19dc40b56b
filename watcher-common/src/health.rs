//! Health reporting for the long-running loops of each service.
//!
//! Every service runs one or more asynchronous loops (a poll loop, a
//! consume loop) that can silently wedge. Each loop registers with the
//! process' [`HealthRegistry`] and reports in more often than its
//! deadline; a loop that stops reporting flips the liveness probe to
//! unhealthy so the supervisor restarts the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True only when every registered component is healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, must report again before the date.
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline
    /// the component registered with.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
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
                    // Poisoned lock: the probes will fail and the process restart.
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Register a component. The returned handle is passed to the
    /// component so it can report its status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The overall process status, computed from every registered
    /// component. Usable directly as an axum handler response.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let mut result = HealthStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = Utc::now();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        match result.healthy {
            true => tracing::debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
