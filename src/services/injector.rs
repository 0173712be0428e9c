//! Dependency-ordered service initialization with retry and degradation
//!
//! The injector topologically orders registered services by their declared
//! dependencies, refuses to start at all when the graph has a cycle, retries
//! each initialization under a shared backoff policy, and allows explicitly
//! whitelisted services to fail-but-continue outside production.

use super::registry::ServiceRegistry;
use super::ServiceState;
use crate::config::{Environment, ServicesConfig};
use crate::utils::errors::MaestroError;
use crate::utils::retry::RetryPolicy;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// How often a concurrently-initializing service is re-checked
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one full initialization pass
#[derive(Debug, Clone, Default)]
pub struct InitializationReport {
    /// Services that reached `Ready`, in initialization order
    pub ready: Vec<String>,
    /// Whitelisted services that failed but were allowed to continue
    pub degraded: Vec<String>,
}

/// Drives registered services through their lifecycle in dependency order
pub struct DependencyInjector {
    registry: Arc<ServiceRegistry>,
    retry: RetryPolicy,
    config: ServicesConfig,
}

impl DependencyInjector {
    pub fn new(registry: Arc<ServiceRegistry>, config: ServicesConfig) -> Self {
        let retry = RetryPolicy::new(
            config.init_retry_attempts,
            Duration::from_millis(config.init_retry_base_delay_ms),
        );
        Self {
            registry,
            retry,
            config,
        }
    }

    /// Topologically order all registered services by declared dependencies
    ///
    /// Dependencies come before dependents. A dependency cycle is reported by
    /// its path (e.g. `a -> b -> c -> a`); a named-but-unregistered dependency
    /// is only a warning, since optional collaborators may be absent.
    pub async fn resolve_dependencies(&self) -> Result<Vec<String>> {
        let registrations = self.registry.list().await;
        let graph: HashMap<String, Vec<String>> = registrations
            .iter()
            .map(|r| (r.name.clone(), r.dependencies.clone()))
            .collect();

        let mut order = Vec::with_capacity(graph.len());
        let mut visited = HashSet::new();
        let mut visiting = Vec::new();

        for registration in &registrations {
            visit(
                &registration.name,
                &graph,
                &mut visited,
                &mut visiting,
                &mut order,
            )?;
        }
        Ok(order)
    }

    /// Initialize every auto-start service (and its transitive dependencies)
    /// in dependency order
    ///
    /// Refuses to initialize anything when the dependency graph has a cycle.
    /// A service failing all retry attempts aborts startup unless it is on
    /// the graceful-degradation whitelist in a non-production environment.
    pub async fn initialize_services(&self) -> Result<InitializationReport> {
        let order = self.resolve_dependencies().await?;
        let required = self.required_services(&order).await;

        let mut report = InitializationReport::default();
        for name in order {
            if !required.contains(&name) {
                continue;
            }
            match self.initialize_one(&name).await? {
                InitOutcome::Ready => report.ready.push(name),
                InitOutcome::Degraded => report.degraded.push(name),
                InitOutcome::AlreadyReady => {}
            }
        }

        tracing::info!(
            ready = report.ready.len(),
            degraded = report.degraded.len(),
            "service initialization complete"
        );
        Ok(report)
    }

    /// Destroy services in reverse dependency order
    ///
    /// Individual destroy failures are logged and do not stop the teardown.
    pub async fn shutdown(&self) -> Result<()> {
        let mut order = self.resolve_dependencies().await?;
        order.reverse();

        for name in order {
            let Some(registration) = self.registry.registration(&name).await else {
                continue;
            };
            if registration.state == ServiceState::Destroyed {
                continue;
            }
            if let Some(service) = self.registry.get(&name).await {
                if let Err(e) = service.destroy().await {
                    tracing::warn!(service = name.as_str(), "destroy failed: {}", e);
                }
            }
            self.registry.set_state(&name, ServiceState::Destroyed).await;
        }
        tracing::info!("service teardown complete");
        Ok(())
    }

    /// Auto-start services plus everything they transitively depend on
    async fn required_services(&self, order: &[String]) -> HashSet<String> {
        let registrations = self.registry.list().await;
        let deps: HashMap<&str, &[String]> = registrations
            .iter()
            .map(|r| (r.name.as_str(), r.dependencies.as_slice()))
            .collect();

        let mut required: HashSet<String> = registrations
            .iter()
            .filter(|r| r.auto_start)
            .map(|r| r.name.clone())
            .collect();

        // Walk in reverse topological order so dependents mark their
        // dependencies before those are considered
        for name in order.iter().rev() {
            if required.contains(name) {
                if let Some(dependencies) = deps.get(name.as_str()) {
                    for dep in *dependencies {
                        required.insert(dep.clone());
                    }
                }
            }
        }
        required
    }

    async fn initialize_one(&self, name: &str) -> Result<InitOutcome> {
        let registration = self
            .registry
            .registration(name)
            .await
            .ok_or_else(|| MaestroError::not_found(format!("service {}", name)))?;

        match registration.state {
            ServiceState::Ready => return Ok(InitOutcome::AlreadyReady),
            ServiceState::Initializing => {
                self.poll_until_ready(name).await?;
                return Ok(InitOutcome::AlreadyReady);
            }
            _ => {}
        }

        let service = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| MaestroError::not_found(format!("service {}", name)))?;

        // Dependencies were initialized earlier in topological order; a
        // degraded dependency is noted but does not block the dependent
        for dep in &registration.dependencies {
            match self.registry.registration(dep).await {
                Some(record) if record.state == ServiceState::Ready => {}
                Some(record) if record.state == ServiceState::Error => {
                    tracing::warn!(
                        service = name,
                        dependency = dep.as_str(),
                        "dependency is degraded; continuing"
                    );
                }
                Some(record) => {
                    tracing::warn!(
                        service = name,
                        dependency = dep.as_str(),
                        state = ?record.state,
                        "dependency is not ready"
                    );
                }
                None => {
                    tracing::warn!(
                        service = name,
                        dependency = dep.as_str(),
                        "dependency is not registered; treating as optional"
                    );
                }
            }
        }

        self.registry.set_state(name, ServiceState::Initializing).await;
        tracing::info!(service = name, "initializing");

        let result = self
            .retry
            .run(&format!("initialize {}", name), || service.initialize())
            .await;

        match result {
            Ok(()) => {
                self.registry.set_state(name, ServiceState::Ready).await;
                tracing::info!(service = name, "ready");
                Ok(InitOutcome::Ready)
            }
            Err(e) => {
                self.registry.set_state(name, ServiceState::Error).await;
                if self.is_degradable(name) {
                    tracing::warn!(
                        service = name,
                        "initialization failed but service is optional in {:?}: {}",
                        self.config.environment,
                        e
                    );
                    Ok(InitOutcome::Degraded)
                } else {
                    Err(MaestroError::service(
                        name,
                        format!("initialization failed after retries: {}", e),
                    ))
                }
            }
        }
    }

    /// Wait for a concurrently-initializing service instead of re-invoking it
    async fn poll_until_ready(&self, name: &str) -> Result<()> {
        let service = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| MaestroError::not_found(format!("service {}", name)))?;

        let timeout = Duration::from_millis(self.config.init_poll_timeout_ms);
        let started = std::time::Instant::now();
        while started.elapsed() < timeout {
            if service.is_ready() {
                self.registry.set_state(name, ServiceState::Ready).await;
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(MaestroError::timeout(self.config.init_poll_timeout_ms))
    }

    /// The narrowly-scoped graceful-degradation escape hatch
    fn is_degradable(&self, name: &str) -> bool {
        self.config.environment != Environment::Production
            && self.config.optional_services.iter().any(|s| s == name)
    }
}

enum InitOutcome {
    Ready,
    Degraded,
    AlreadyReady,
}

/// DFS visit tracking a "currently visiting" path distinct from "fully
/// visited"; any back-edge into the path is a cycle, reported by that path
fn visit(
    name: &str,
    graph: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    visiting: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(name) {
        return Ok(());
    }
    if let Some(start) = visiting.iter().position(|n| n == name) {
        let mut path: Vec<&str> = visiting[start..].iter().map(String::as_str).collect();
        path.push(name);
        return Err(MaestroError::dependency_cycle(path.join(" -> ")));
    }

    visiting.push(name.to_string());
    if let Some(dependencies) = graph.get(name) {
        for dep in dependencies {
            if graph.contains_key(dep) {
                visit(dep, graph, visited, visiting, order)?;
            } else {
                tracing::warn!(
                    service = name,
                    dependency = dep.as_str(),
                    "declared dependency is not registered"
                );
            }
        }
    }
    visiting.pop();
    visited.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}
