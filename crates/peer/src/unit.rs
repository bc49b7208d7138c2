//! Named callable units and the local registry that owns them.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use network_shared::{Payload, UnitKind};

use crate::error::PeerError;

/// Something a peer can invoke by name.
///
/// Actions return a result; receivers are invoked one-way and their result is
/// discarded.
#[async_trait]
pub trait Unit: Send + Sync + 'static {
    async fn execute(&self, arg: Payload) -> anyhow::Result<Payload>;
}

struct UnitFn<F>(F);

#[async_trait]
impl<F, Fut> Unit for UnitFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn execute(&self, arg: Payload) -> anyhow::Result<Payload> {
        (self.0)(arg).await
    }
}

/// Wraps an async closure as an action.
pub fn unit_fn<F, Fut>(f: F) -> Arc<dyn Unit>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    Arc::new(UnitFn(f))
}

/// Wraps an async closure with no result as a receiver.
pub fn receiver_fn<F, Fut>(f: F) -> Arc<dyn Unit>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(UnitFn(move |arg| {
        let fut = f(arg);
        async move {
            fut.await?;
            Ok::<_, anyhow::Error>(Payload::null())
        }
    }))
}

struct Registered {
    kind: UnitKind,
    name: String,
    unit: Arc<dyn Unit>,
}

/// Append-only unit table. Names are unique per kind; listing keeps
/// registration order.
#[derive(Default)]
pub struct UnitRegistry {
    units: RwLock<Vec<Registered>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: UnitKind,
        name: &str,
        unit: Arc<dyn Unit>,
    ) -> Result<(), PeerError> {
        if name.trim().is_empty() {
            return Err(PeerError::EmptyUnitName);
        }
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.iter().any(|u| u.kind == kind && u.name == name) {
            return Err(PeerError::DuplicateUnit {
                kind,
                name: name.to_string(),
            });
        }
        units.push(Registered {
            kind,
            name: name.to_string(),
            unit,
        });
        Ok(())
    }

    pub fn get(&self, kind: UnitKind, name: &str) -> Option<Arc<dyn Unit>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|u| u.kind == kind && u.name == name)
            .map(|u| Arc::clone(&u.unit))
    }

    pub fn contains(&self, kind: UnitKind, name: &str) -> bool {
        self.get(kind, name).is_some()
    }

    pub fn names(&self, kind: UnitKind) -> Vec<String> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|u| u.kind == kind)
            .map(|u| u.name.clone())
            .collect()
    }
}
