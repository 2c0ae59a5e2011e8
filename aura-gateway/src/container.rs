//! Service container: ordered construction, startup, shutdown, health
//!
//! Services register by name with an explicit dependency list and a
//! priority. `start_all` computes a topological order (dependencies first,
//! ties broken by priority then name) and walks it; `stop_all` walks the
//! same order in reverse. A failed initialization aborts startup naming
//! the offending service; cycles and unknown dependencies are rejected
//! before anything starts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Lifecycle states of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registered,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Health snapshot of one service
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Narrow capability set every managed service implements
#[async_trait]
pub trait Service: Send + Sync {
    /// Acquire resources; failure here is fatal for startup
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Begin serving; called after every dependency is RUNNING
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop serving and release resources
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> ComponentHealth {
        ComponentHealth::ok()
    }
}

struct Registration {
    name: String,
    service: Arc<dyn Service>,
    deps: Vec<String>,
    priority: i32,
}

/// Owns every service singleton and drives their lifecycle
pub struct ServiceContainer {
    entries: Vec<Registration>,
    states: Mutex<HashMap<String, ServiceState>>,
    start_order: Mutex<Vec<usize>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            states: Mutex::new(HashMap::new()),
            start_order: Mutex::new(Vec::new()),
        }
    }

    /// Register a service with its dependencies and tie-break priority
    pub fn register(
        &mut self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
        deps: &[&str],
        priority: i32,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::Conflict(format!(
                "service '{}' is already registered",
                name
            )));
        }
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(name.clone(), ServiceState::Registered);
        self.entries.push(Registration {
            name,
            service,
            deps: deps.iter().map(|d| d.to_string()).collect(),
            priority,
        });
        Ok(())
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.states
            .lock()
            .expect("state lock poisoned")
            .get(name)
            .copied()
    }

    fn set_state(&self, name: &str, state: ServiceState) {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(name.to_string(), state);
    }

    /// Kahn's algorithm over the dependency graph; the ready set is kept
    /// sorted by (priority, name) so ties are deterministic
    fn topo_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.entries.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.entries.len()];
        for (i, entry) in self.entries.iter().enumerate() {
            for dep in &entry.deps {
                let Some(&dep_index) = index.get(dep.as_str()) else {
                    return Err(Error::Internal(format!(
                        "service '{}' depends on unregistered '{}'",
                        entry.name, dep
                    )));
                };
                in_degree[i] += 1;
                dependents[dep_index].push(i);
            }
        }

        let mut ready: Vec<usize> = (0..self.entries.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.entries.len());
        while !ready.is_empty() {
            ready.sort_by(|&a, &b| {
                self.entries[a]
                    .priority
                    .cmp(&self.entries[b].priority)
                    .then_with(|| self.entries[a].name.cmp(&self.entries[b].name))
            });
            let next = ready.remove(0);
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        if order.len() != self.entries.len() {
            let stuck: Vec<&str> = (0..self.entries.len())
                .filter(|i| !order.contains(i))
                .map(|i| self.entries[i].name.as_str())
                .collect();
            return Err(Error::Internal(format!(
                "circular service dependencies among: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Initialize and start every service in dependency order
    pub async fn start_all(&self) -> Result<()> {
        let order = self.topo_order()?;
        *self.start_order.lock().expect("order lock poisoned") = order.clone();

        for &i in &order {
            let entry = &self.entries[i];
            self.set_state(&entry.name, ServiceState::Initializing);
            tracing::info!(service = %entry.name, "Initializing");
            if let Err(e) = entry.service.initialize().await {
                self.set_state(&entry.name, ServiceState::Failed);
                return Err(Error::Internal(format!(
                    "service '{}' failed to initialize: {}",
                    entry.name, e
                )));
            }
            if let Err(e) = entry.service.start().await {
                self.set_state(&entry.name, ServiceState::Failed);
                return Err(Error::Internal(format!(
                    "service '{}' failed to start: {}",
                    entry.name, e
                )));
            }
            self.set_state(&entry.name, ServiceState::Running);
            tracing::info!(service = %entry.name, "Running");
        }
        Ok(())
    }

    /// Stop every running service in reverse start order
    pub async fn stop_all(&self) {
        let order = self.start_order.lock().expect("order lock poisoned").clone();
        for &i in order.iter().rev() {
            let entry = &self.entries[i];
            if self.state(&entry.name) != Some(ServiceState::Running) {
                continue;
            }
            self.set_state(&entry.name, ServiceState::Stopping);
            tracing::info!(service = %entry.name, "Stopping");
            if let Err(e) = entry.service.stop().await {
                tracing::warn!(service = %entry.name, error = %e, "Stop failed");
            }
            self.set_state(&entry.name, ServiceState::Stopped);
        }
    }

    /// Aggregate health: `ok` when everything is healthy, `down` when
    /// nothing is, `degraded` in between
    pub async fn health_rollup(&self) -> serde_json::Value {
        let mut components = serde_json::Map::new();
        let mut healthy = 0usize;
        for entry in &self.entries {
            let running = self.state(&entry.name) == Some(ServiceState::Running);
            let health = if running {
                entry.service.health().await
            } else {
                ComponentHealth::down("not running")
            };
            if health.healthy {
                healthy += 1;
            }
            components.insert(
                entry.name.clone(),
                serde_json::json!({
                    "healthy": health.healthy,
                    "detail": health.detail,
                }),
            );
        }

        let status = if self.entries.is_empty() || healthy == self.entries.len() {
            "ok"
        } else if healthy == 0 {
            "down"
        } else {
            "degraded"
        };
        serde_json::json!({ "status": status, "components": components })
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}
