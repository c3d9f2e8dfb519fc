use core::fmt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ReplicaError, Result};
use crate::graph::Output;
use crate::value::ReplicaValue;

use super::{ComponentVariable, UpdateKind};

/// Replication-aware handle cache of an accelerator rewrite context.
///
/// Handles are keyed by a stable per-variable id, so repeated lookups of the same
/// variable within one context share a handle.
pub trait HandleCache<V: ReplicaValue>: Send + Sync {
    /// The handle registered under `handle_id`, created from `components` on
    /// first use.
    fn replicated_handle(
        &self,
        handle_id: &str,
        components: &[ComponentVariable<V>],
        is_mirrored: bool,
    ) -> ReplicatedHandle<V>;
}

struct ReplicatedInner<V> {
    id: String,
    components: Vec<ComponentVariable<V>>,
    is_mirrored: bool,
}

/// One handle standing for every component of a variable. Inside a replicated
/// computation it resolves to the running replica's component.
pub struct ReplicatedHandle<V> {
    inner: Arc<ReplicatedInner<V>>,
}

impl<V> Clone for ReplicatedHandle<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: ReplicaValue> ReplicatedHandle<V> {
    /// A handle over `components`.
    pub fn new(id: impl Into<String>, components: Vec<ComponentVariable<V>>, is_mirrored: bool) -> Self {
        Self {
            inner: Arc::new(ReplicatedInner {
                id: id.into(),
                components,
                is_mirrored,
            }),
        }
    }

    /// The id the handle is cached under.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the components are kept equal.
    pub fn is_mirrored(&self) -> bool {
        self.inner.is_mirrored
    }

    /// The components, in replica order.
    pub fn components(&self) -> &[ComponentVariable<V>] {
        &self.inner.components
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The component of the running replica. Mirrored handles fall back to the
    /// primary outside of any replica.
    pub fn component(&self, ctx: &Context<'_, V>) -> Result<&ComponentVariable<V>> {
        let replica = match ctx.current_replica_id() {
            Some(id) => id,
            None if self.inner.is_mirrored => 0,
            None => {
                return Err(ReplicaError::usage(format!(
                    "Replicated handle {} needs a replica id to resolve a sync-on-read component",
                    self.inner.id
                )));
            }
        };
        self.inner.components.get(replica).ok_or_else(|| {
            ReplicaError::usage(format!(
                "Replica {replica} is out of range for replicated handle {}",
                self.inner.id
            ))
        })
    }
}

impl<V: ReplicaValue> fmt::Debug for ReplicatedHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedHandle")
            .field("id", &self.inner.id)
            .field("replicas", &self.inner.components.len())
            .field("is_mirrored", &self.inner.is_mirrored)
            .finish()
    }
}

/// The handle of a distributed variable.
#[derive(Debug, Clone)]
pub enum VariableHandle<V: ReplicaValue> {
    /// The component of one replica.
    Component(ComponentVariable<V>),
    /// The replicated handle of an accelerator context.
    Replicated(ReplicatedHandle<V>),
}

impl<V: ReplicaValue> VariableHandle<V> {
    /// Reads through the handle.
    pub fn read(&self, ctx: &Context<'_, V>) -> Result<V> {
        match self {
            Self::Component(component) => component.read(),
            Self::Replicated(handle) => handle.component(ctx)?.read(),
        }
    }

    /// Writes through the handle, without any aggregation.
    pub fn apply(&self, ctx: &Context<'_, V>, kind: UpdateKind, value: V) -> Result<Output<V>> {
        match self {
            Self::Component(component) => kind.apply(component, value),
            Self::Replicated(handle) => kind.apply(handle.component(ctx)?, value),
        }
    }
}

/// An in-memory accelerator rewrite context.
///
/// Enter it with [`Context::in_accelerator`]. Variables created on the
/// accelerator platform then resolve their handles through this cache.
pub struct AcceleratorContext<V: ReplicaValue> {
    handles: Mutex<HashMap<String, ReplicatedHandle<V>>>,
}

impl<V: ReplicaValue> Default for AcceleratorContext<V> {
    fn default() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: ReplicaValue> AcceleratorContext<V> {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no handle was created yet.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl<V: ReplicaValue> HandleCache<V> for AcceleratorContext<V> {
    fn replicated_handle(
        &self,
        handle_id: &str,
        components: &[ComponentVariable<V>],
        is_mirrored: bool,
    ) -> ReplicatedHandle<V> {
        self.handles
            .lock()
            .entry(handle_id.to_string())
            .or_insert_with(|| ReplicatedHandle::new(handle_id, components.to_vec(), is_mirrored))
            .clone()
    }
}
