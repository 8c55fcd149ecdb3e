use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::warn;

/// Liveness of the long-running loops of a process.
///
/// The batcher and every partition poller register a component and must
/// report again before their deadline. The process is live only when
/// every registered component reported within its deadline and none
/// reported itself unhealthy. With no component registered yet, the
/// process is not live.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Reported by `get_status` when a HealthyUntil deadline has passed.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self.components);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: std::time::Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        self.report_status(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: String, deadline: std::time::Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned health registry lock");
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let effective = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        if !status.healthy {
            warn!("health check failed: {:?}", status.components);
        }
        status
    }
}
