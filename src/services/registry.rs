//! Service registry: name -> instance bookkeeping with per-service metadata

use super::{Service, ServiceHealth, ServiceState};
use crate::utils::errors::MaestroError;
use crate::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registration metadata supplied alongside a service instance
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Names of services that must be ready before this one initializes
    pub dependencies: Vec<String>,
    /// Relative importance, for display and diagnostics
    pub priority: i32,
    /// Whether `initialize_services` brings this service up automatically
    pub auto_start: bool,
}

impl ServiceOptions {
    pub fn auto_start() -> Self {
        Self {
            auto_start: true,
            ..Self::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// One service's registration record
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub name: String,
    pub state: ServiceState,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub auto_start: bool,
    pub registered_at: DateTime<Utc>,
}

struct RegisteredService {
    service: Arc<dyn Service>,
    registration: ServiceRegistration,
}

/// Name -> instance lookup with per-service metadata; no logic beyond
/// bookkeeping. Registration order is preserved.
pub struct ServiceRegistry {
    services: RwLock<IndexMap<String, RegisteredService>>,
    max_services: usize,
}

impl ServiceRegistry {
    pub fn new(max_services: usize) -> Self {
        Self {
            services: RwLock::new(IndexMap::new()),
            max_services,
        }
    }

    /// Register a service; replacing an existing name destroys the old
    /// instance first
    pub async fn register(&self, service: Arc<dyn Service>, options: ServiceOptions) -> Result<()> {
        let name = service.name().to_string();

        let replaced = {
            let mut services = self.services.write().await;

            if !services.contains_key(&name) && services.len() >= self.max_services {
                return Err(MaestroError::service(
                    &name,
                    format!("registry full ({} services)", self.max_services),
                ));
            }

            let registration = ServiceRegistration {
                name: name.clone(),
                state: ServiceState::Created,
                dependencies: options.dependencies,
                priority: options.priority,
                auto_start: options.auto_start,
                registered_at: Utc::now(),
            };
            services.insert(
                name.clone(),
                RegisteredService {
                    service,
                    registration,
                },
            )
        };

        if let Some(old) = replaced {
            tracing::info!(service = name.as_str(), "replacing registration; destroying old instance");
            if let Err(e) = old.service.destroy().await {
                tracing::warn!(service = name.as_str(), "old instance destroy failed: {}", e);
            }
        } else {
            tracing::debug!(service = name.as_str(), "service registered");
        }
        Ok(())
    }

    /// Remove a registration and destroy its instance
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.services.write().await.shift_remove(name);
        match removed {
            Some(entry) => {
                if let Err(e) = entry.service.destroy().await {
                    tracing::warn!(service = name, "destroy on unregister failed: {}", e);
                }
                tracing::debug!(service = name, "service unregistered");
                Ok(())
            }
            None => Err(MaestroError::not_found(format!("service {}", name))),
        }
    }

    /// Look up a service instance
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .await
            .get(name)
            .map(|entry| entry.service.clone())
    }

    /// Look up a registration record
    pub async fn registration(&self, name: &str) -> Option<ServiceRegistration> {
        self.services
            .read()
            .await
            .get(name)
            .map(|entry| entry.registration.clone())
    }

    /// All registration records in registration order
    pub async fn list(&self) -> Vec<ServiceRegistration> {
        self.services
            .read()
            .await
            .values()
            .map(|entry| entry.registration.clone())
            .collect()
    }

    /// Registrations currently in the given state
    pub async fn in_state(&self, state: ServiceState) -> Vec<ServiceRegistration> {
        self.services
            .read()
            .await
            .values()
            .filter(|entry| entry.registration.state == state)
            .map(|entry| entry.registration.clone())
            .collect()
    }

    /// Record an observed lifecycle state for a service
    pub async fn set_state(&self, name: &str, state: ServiceState) {
        if let Some(entry) = self.services.write().await.get_mut(name) {
            tracing::debug!(service = name, from = ?entry.registration.state, to = ?state, "state transition");
            entry.registration.state = state;
        }
    }

    /// Health snapshots for every registered service
    pub async fn health_report(&self) -> Vec<(String, ServiceHealth)> {
        self.services
            .read()
            .await
            .values()
            .map(|entry| (entry.registration.name.clone(), entry.service.health()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Destroy every instance and drop all registrations
    pub async fn clear(&self) {
        let drained: Vec<RegisteredService> = {
            let mut services = self.services.write().await;
            services.drain(..).map(|(_, entry)| entry).collect()
        };

        let destroys = drained.iter().map(|entry| entry.service.destroy());
        for (entry, result) in drained.iter().zip(futures::future::join_all(destroys).await) {
            if let Err(e) = result {
                tracing::warn!(
                    service = entry.registration.name.as_str(),
                    "destroy on clear failed: {}",
                    e
                );
            }
        }
        tracing::info!("service registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        name: String,
        destroys: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Service for CountingService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn state(&self) -> ServiceState {
            ServiceState::Created
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn service(name: &str, destroys: &Arc<AtomicUsize>) -> Arc<CountingService> {
        Arc::new(CountingService {
            name: name.to_string(),
            destroys: destroys.clone(),
        })
    }

    #[tokio::test]
    async fn test_register_get_list() {
        let registry = ServiceRegistry::new(8);
        let destroys = Arc::new(AtomicUsize::new(0));

        registry
            .register(
                service("llm", &destroys),
                ServiceOptions::auto_start().with_priority(10),
            )
            .await
            .unwrap();
        registry
            .register(
                service("store", &destroys),
                ServiceOptions::auto_start().with_dependencies(["llm"]),
            )
            .await
            .unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("llm").await.is_some());
        assert!(registry.get("missing").await.is_none());

        // Registration order is preserved
        let names: Vec<String> = registry.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["llm", "store"]);

        let record = registry.registration("store").await.unwrap();
        assert_eq!(record.dependencies, vec!["llm"]);
        assert_eq!(record.state, ServiceState::Created);
    }

    #[tokio::test]
    async fn test_replace_destroys_old_instance() {
        let registry = ServiceRegistry::new(8);
        let destroys = Arc::new(AtomicUsize::new(0));

        registry
            .register(service("llm", &destroys), ServiceOptions::default())
            .await
            .unwrap();
        registry
            .register(service("llm", &destroys), ServiceOptions::default())
            .await
            .unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_services_enforced() {
        let registry = ServiceRegistry::new(1);
        let destroys = Arc::new(AtomicUsize::new(0));

        registry
            .register(service("first", &destroys), ServiceOptions::default())
            .await
            .unwrap();
        let err = registry
            .register(service("second", &destroys), ServiceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "service");

        // Replacing an existing name is allowed at capacity
        registry
            .register(service("first", &destroys), ServiceOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_tracking_and_filtering() {
        let registry = ServiceRegistry::new(8);
        let destroys = Arc::new(AtomicUsize::new(0));

        registry
            .register(service("a", &destroys), ServiceOptions::default())
            .await
            .unwrap();
        registry
            .register(service("b", &destroys), ServiceOptions::default())
            .await
            .unwrap();
        registry.set_state("a", ServiceState::Ready).await;

        let ready = registry.in_state(ServiceState::Ready).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name, "a");
        assert_eq!(registry.in_state(ServiceState::Created).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_and_clear_destroy() {
        let registry = ServiceRegistry::new(8);
        let destroys = Arc::new(AtomicUsize::new(0));

        registry
            .register(service("a", &destroys), ServiceOptions::default())
            .await
            .unwrap();
        registry
            .register(service("b", &destroys), ServiceOptions::default())
            .await
            .unwrap();

        registry.unregister("a").await.unwrap();
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert!(registry.unregister("a").await.is_err());

        registry.clear().await;
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty().await);
    }
}
