//! Type-indexed service environment.
//!
//! An [`Env`] is the "output object" of a layer: a small immutable map
//! from service type to a shared instance of that service. Layers that
//! combine several outputs merge their environments with [`Env::union`],
//! which is a shallow overwrite — the right-hand side wins on conflicts.
//!
//! # Example
//!
//! ```ignore
//! use strata::Env;
//!
//! struct Config { url: String }
//!
//! let env = Env::new().with(Config { url: "db://local".into() });
//! let config = env.get::<Config>().unwrap();
//! assert_eq!(config.url, "db://local");
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A shared service instance plus its type name for diagnostics.
#[derive(Clone)]
struct Service {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// An immutable, type-indexed map of services.
///
/// Cloning is cheap (services are `Arc`-shared); mutation always produces
/// a new map, so environments can be captured freely by concurrent
/// branches of a dependency graph.
#[derive(Clone, Default)]
pub struct Env {
    services: HashMap<TypeId, Service>,
}

impl Env {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new environment with `service` added, replacing any
    /// existing service of the same type.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.services.insert(
            TypeId::of::<T>(),
            Service {
                name: type_name::<T>(),
                value: Arc::new(service),
            },
        );
        self
    }

    /// Like [`Env::with`] but reuses an existing shared instance.
    pub fn with_shared<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.services.insert(
            TypeId::of::<T>(),
            Service {
                name: type_name::<T>(),
                value: service,
            },
        );
        self
    }

    /// Looks up a service by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|service| service.value.clone().downcast::<T>().ok())
    }

    /// True if a service of type `T` is present.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    /// Merges two environments; entries in `other` overwrite entries here.
    pub fn union(&self, other: &Env) -> Env {
        let mut services = self.services.clone();
        for (key, service) in &other.services {
            services.insert(*key, service.clone());
        }
        Env { services }
    }

    /// Number of services in the environment.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True if no services are present.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.services.values().map(|s| s.name).collect();
        names.sort_unstable();
        f.debug_tuple("Env").field(&names).finish()
    }
}
