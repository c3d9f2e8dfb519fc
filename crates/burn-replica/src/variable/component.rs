use burn_tensor::DType;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::graph::{Op, Output};
use crate::value::ReplicaValue;

/// Process-unique id of a physical variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

impl ComponentId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ComponentInner<V> {
    id: ComponentId,
    name: String,
    device: Device,
    trainable: bool,
    initial_value: V,
    value: RwLock<Option<V>>,
}

/// One physical replica of a variable, living on one device.
///
/// Cloning shares the same storage. Writes are applied under a lock, so an
/// incremental update never loses a concurrent one.
pub struct ComponentVariable<V> {
    inner: Arc<ComponentInner<V>>,
}

impl<V> Clone for ComponentVariable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The three physical update primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Replace the value.
    Assign,
    /// Add to the value.
    AssignAdd,
    /// Subtract from the value.
    AssignSub,
}

impl UpdateKind {
    /// Applies the update to `component`.
    pub fn apply<V: ReplicaValue>(self, component: &ComponentVariable<V>, value: V) -> Result<Output<V>> {
        match self {
            Self::Assign => component.assign(value),
            Self::AssignAdd => component.assign_add(value),
            Self::AssignSub => component.assign_sub(value),
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::AssignAdd => "assign_add",
            Self::AssignSub => "assign_sub",
        }
    }
}

impl<V: ReplicaValue> ComponentVariable<V> {
    /// A variable already holding `initial_value`.
    pub fn new(name: impl Into<String>, device: Device, initial_value: V, trainable: bool) -> Self {
        let component = Self::deferred(name, device, initial_value, trainable);
        *component.inner.value.write() = Some(component.inner.initial_value.clone());
        component
    }

    /// A variable that holds no value until its initializer runs.
    pub fn deferred(name: impl Into<String>, device: Device, initial_value: V, trainable: bool) -> Self {
        Self {
            inner: Arc::new(ComponentInner {
                id: ComponentId::next(),
                name: name.into(),
                device,
                trainable,
                initial_value,
                value: RwLock::new(None),
            }),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> ComponentId {
        self.inner.id
    }

    /// Full name, e.g. `dense/kernel:0`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Device holding the value.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Whether the variable is trained.
    pub fn trainable(&self) -> bool {
        self.inner.trainable
    }

    /// The value stored by the initializer.
    pub fn initial_value(&self) -> &V {
        &self.inner.initial_value
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.inner.initial_value.dtype()
    }

    /// Dimensions, fixed at creation.
    pub fn shape(&self) -> Vec<usize> {
        self.inner.initial_value.shape()
    }

    /// The current value.
    pub fn read(&self) -> Result<V> {
        self.inner.value.read().clone().ok_or_else(|| self.uninitialized())
    }

    /// Whether the variable holds a value, checked when the output is evaluated.
    pub fn is_initialized(&self) -> Output<bool> {
        let inner = self.inner.clone();
        Output::from_fn(Some(self.inner.device.clone()), move || {
            inner.value.read().is_some()
        })
    }

    /// Stores the initial value when run.
    pub fn initializer(&self) -> Op {
        let inner = self.inner.clone();
        Op::named_fn(
            Some(&format!("{}/Assign", self.inner.name)),
            Some(self.inner.device.clone()),
            Vec::new(),
            move || *inner.value.write() = Some(inner.initial_value.clone()),
        )
    }

    /// Stores `value` when run.
    pub fn assign_op(&self, value: V) -> Op {
        let inner = self.inner.clone();
        Op::from_fn(Some(self.inner.device.clone()), move || {
            *inner.value.write() = Some(value);
        })
    }

    /// Replaces the value, returning the value written.
    pub fn assign(&self, value: V) -> Result<Output<V>> {
        self.check_shape(&value)?;
        *self.inner.value.write() = Some(value.clone());
        Ok(Output::ready(Some(self.inner.device.clone()), value))
    }

    /// Adds `delta` to the value, returning the value written.
    pub fn assign_add(&self, delta: V) -> Result<Output<V>> {
        self.update_with(&delta, |current| current.add_value(&delta))
    }

    /// Subtracts `delta` from the value, returning the value written.
    pub fn assign_sub(&self, delta: V) -> Result<Output<V>> {
        self.update_with(&delta, |current| current.sub_value(&delta))
    }

    fn update_with(&self, delta: &V, f: impl FnOnce(&V) -> V) -> Result<Output<V>> {
        self.check_shape(delta)?;
        let mut slot = self.inner.value.write();
        let Some(current) = slot.as_ref() else {
            return Err(self.uninitialized());
        };
        let updated = f(current);
        *slot = Some(updated.clone());
        Ok(Output::ready(Some(self.inner.device.clone()), updated))
    }

    fn check_shape(&self, value: &V) -> Result<()> {
        let expected = self.shape();
        let actual = value.shape();
        if expected != actual {
            return Err(ReplicaError::usage(format!(
                "Shapes {actual:?} and {expected:?} are incompatible for variable {}",
                self.inner.name
            )));
        }
        Ok(())
    }

    fn uninitialized(&self) -> ReplicaError {
        ReplicaError::usage(format!(
            "Variable {} is read before its initializer ran",
            self.inner.name
        ))
    }
}

impl<V: ReplicaValue> fmt::Debug for ComponentVariable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVariable")
            .field("name", &self.inner.name)
            .field("device", &self.inner.device)
            .field("value", &*self.inner.value.read())
            .finish()
    }
}
