use core::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::graph::{Op, Output};
use crate::value::ReplicaValue;
use crate::variable::{AggregatingVariable, ComponentVariable, DistributedVariable};

/// Values that live on a device.
pub trait Placed {
    /// The device holding the value, if it is placed.
    fn device(&self) -> Option<Device>;
}

/// An ordered, immutable tuple of per-replica values. Index `i` belongs to replica `i`.
///
/// The number of values equals the number of replicas in sync for the lifetime of
/// the container. Containers are compared by reference with [`DistributedValues::ptr_eq`],
/// never by value.
pub struct DistributedValues<T> {
    values: Arc<[T]>,
}

impl<T> Clone for DistributedValues<T> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
        }
    }
}

impl<T> DistributedValues<T> {
    /// Wraps one value per replica.
    pub fn new(values: Vec<T>) -> Result<Self> {
        if values.is_empty() {
            return Err(ReplicaError::usage(
                "Distributed values need at least one replica value",
            ));
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// The representative value, replica 0's.
    pub fn primary(&self) -> &T {
        &self.values[0]
    }

    /// All values in replica order.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; kept for symmetry with [`DistributedValues::len`].
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }

    /// The value of one replica.
    pub fn replica(&self, replica_id: usize) -> Result<&T> {
        self.values.get(replica_id).ok_or_else(|| {
            ReplicaError::usage(format!(
                "Replica {replica_id} is out of range for {} values",
                self.values.len()
            ))
        })
    }

    /// The value of the current replica. Fails in cross-replica context, where
    /// only kinds that know how to resolve a cross-replica read can answer.
    pub fn get<V: ReplicaValue>(&self, ctx: &Context<'_, V>) -> Result<&T> {
        match ctx.current_replica_id() {
            Some(id) => self.replica(id),
            None => Err(ReplicaError::capability(
                "Cross-replica access is not supported for unsynchronized values",
            )),
        }
    }
}

impl<V: ReplicaValue> DistributedValues<Item<V>> {
    /// Whether every replica holds a computed value.
    pub fn is_tensor_like(&self) -> bool {
        self.values.iter().all(Item::is_tensor_like)
    }
}

impl<T: Placed> DistributedValues<T> {
    /// The value of the current replica, or in cross-replica context the value on
    /// the current device, falling back to the primary.
    pub fn closest<V: ReplicaValue>(&self, ctx: &Context<'_, V>) -> &T {
        if let Some(id) = ctx.current_replica_id() {
            if let Some(value) = self.values.get(id) {
                return value;
            }
        }
        ctx.device()
            .and_then(|device| {
                self.values
                    .iter()
                    .find(|value| value.device().as_ref() == Some(device))
            })
            .unwrap_or_else(|| self.primary())
    }

    /// The device of every replica value.
    pub fn devices(&self) -> Vec<Option<Device>> {
        self.values.iter().map(Placed::device).collect()
    }
}

pub(crate) fn write_values<T: fmt::Debug>(f: &mut fmt::Formatter<'_>, kind: &str, values: &[T]) -> fmt::Result {
    writeln!(f, "{kind}:{{")?;
    for (i, value) in values.iter().enumerate() {
        let sep = if i + 1 < values.len() { "," } else { "" };
        writeln!(f, "  {i}: {value:?}{sep}")?;
    }
    f.write_str("}")
}

/// Per-replica values that are not kept in sync, such as each replica's loss.
pub struct PerReplica<T>(DistributedValues<T>);

impl<T> Clone for PerReplica<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PerReplica<T> {
    /// Wraps one value per replica.
    pub fn new(values: Vec<T>) -> Result<Self> {
        DistributedValues::new(values).map(Self)
    }

    /// The underlying container.
    pub fn inner(&self) -> &DistributedValues<T> {
        &self.0
    }

    /// All values in replica order.
    pub fn values(&self) -> &[T] {
        self.0.values()
    }

    /// See [`DistributedValues::get`]. Cross-replica reads always fail.
    pub fn get<V: ReplicaValue>(&self, ctx: &Context<'_, V>) -> Result<&T> {
        self.0.get(ctx)
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Rebuilds a container from its flattened components.
    pub fn from_components(components: Vec<T>) -> Result<Self> {
        Self::new(components)
    }
}

impl<T: Clone> PerReplica<T> {
    /// Flattens the container into its components.
    ///
    /// Rejected inside a replica context with more than one replica in sync, where
    /// a single replica cannot speak for its peers.
    pub fn to_components<V: ReplicaValue>(&self, ctx: &Context<'_, V>) -> Result<Vec<T>> {
        if !ctx.in_cross_replica_context() && ctx.num_replicas_in_sync() > 1 {
            return Err(ReplicaError::capability(
                "Flattening a PerReplica to components is not supported in replica context",
            ));
        }
        Ok(self.values().to_vec())
    }
}

impl<T: fmt::Debug> fmt::Debug for PerReplica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_values(f, "PerReplica", self.values())
    }
}

impl<T: fmt::Debug> fmt::Display for PerReplica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-replica values that are kept equal, so any replica can answer a
/// cross-replica read.
pub struct Mirrored<T>(DistributedValues<T>);

impl<T> Clone for Mirrored<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Mirrored<T> {
    /// Wraps one value per replica.
    pub fn new(values: Vec<T>) -> Result<Self> {
        DistributedValues::new(values).map(Self)
    }

    /// The underlying container.
    pub fn inner(&self) -> &DistributedValues<T> {
        &self.0
    }

    /// All values in replica order.
    pub fn values(&self) -> &[T] {
        self.0.values()
    }

    /// The representative value.
    pub fn primary(&self) -> &T {
        self.0.primary()
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl<T: Placed> Mirrored<T> {
    /// The current replica's value; in cross-replica context the closest one.
    pub fn get<V: ReplicaValue>(&self, ctx: &Context<'_, V>) -> Result<&T> {
        match ctx.current_replica_id() {
            Some(_) => self.0.get(ctx),
            None => Ok(self.0.closest(ctx)),
        }
    }
}

impl<V: ReplicaValue> Mirrored<Item<V>> {
    /// The plain form of the selected value: a variable's own conversion when the
    /// value is one, otherwise the value itself.
    pub fn as_graph_element(&self, ctx: &Context<'_, V>) -> Result<Option<Item<V>>> {
        match self.get(ctx)? {
            Item::Variable(variable) => variable.as_graph_element(ctx),
            other => Ok(Some(other.clone())),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Mirrored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_values(f, "Mirrored", self.values())
    }
}

impl<T: fmt::Debug> fmt::Display for Mirrored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A leaf of a per-replica structure.
pub enum Item<V: ReplicaValue> {
    /// A computed value.
    Value(Output<V>),
    /// A side effect without a value.
    Op(Op),
    /// One physical replica of a variable.
    Component(ComponentVariable<V>),
    /// A logical variable backed by one component per replica.
    Variable(DistributedVariable<V>),
    /// A single variable whose updates are aggregated across replicas.
    Aggregating(AggregatingVariable<V>),
    /// Unsynchronized per-replica values.
    PerReplica(PerReplica<Item<V>>),
    /// Synchronized per-replica values.
    Mirrored(Mirrored<Item<V>>),
}

impl<V: ReplicaValue> Clone for Item<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(output) => Self::Value(output.clone()),
            Self::Op(op) => Self::Op(op.clone()),
            Self::Component(component) => Self::Component(component.clone()),
            Self::Variable(variable) => Self::Variable(variable.clone()),
            Self::Aggregating(variable) => Self::Aggregating(variable.clone()),
            Self::PerReplica(values) => Self::PerReplica(values.clone()),
            Self::Mirrored(values) => Self::Mirrored(values.clone()),
        }
    }
}

impl<V: ReplicaValue> Item<V> {
    /// A ready value on `device`.
    pub fn value(value: V, device: Option<Device>) -> Self {
        Self::Value(Output::ready(device, value))
    }

    /// Reference equality: both items are the very same object.
    ///
    /// Values are never compared by contents. Two replicas contributing equal but
    /// separately computed values are *not* the same item.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a.ptr_eq(b),
            (Self::Op(a), Self::Op(b)) => a.ptr_eq(b),
            (Self::Component(a), Self::Component(b)) => a.id() == b.id(),
            (Self::Variable(a), Self::Variable(b)) => a.ptr_eq(b),
            (Self::Aggregating(a), Self::Aggregating(b)) => a.ptr_eq(b),
            (Self::PerReplica(a), Self::PerReplica(b)) => a.ptr_eq(b),
            (Self::Mirrored(a), Self::Mirrored(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Whether the item is a computed value.
    pub fn is_tensor_like(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// A short name of the item kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "Value",
            Self::Op(_) => "Op",
            Self::Component(_) => "ComponentVariable",
            Self::Variable(_) => "DistributedVariable",
            Self::Aggregating(_) => "AggregatingVariable",
            Self::PerReplica(_) => "PerReplica",
            Self::Mirrored(_) => "Mirrored",
        }
    }

    /// The output, if the item is a computed value.
    pub fn as_output(&self) -> Option<&Output<V>> {
        match self {
            Self::Value(output) => Some(output),
            _ => None,
        }
    }

    /// Evaluates the item to a value as seen from `ctx`.
    ///
    /// Variables are read, per-replica containers resolve to the current replica,
    /// mirrored containers to the closest replica.
    pub fn evaluate(&self, ctx: &Context<'_, V>) -> Result<V> {
        match self {
            Self::Value(output) => Ok(output.evaluate()),
            Self::Op(_) => Err(ReplicaError::capability("An op has no value to evaluate")),
            Self::Component(component) => component.read(),
            Self::Variable(variable) => Ok(variable.read_value(ctx)?.evaluate()),
            Self::Aggregating(variable) => variable.read_value(),
            Self::PerReplica(values) => values.get(ctx)?.evaluate(ctx),
            Self::Mirrored(values) => values.get(ctx)?.evaluate(ctx),
        }
    }

    /// Waits for the item to complete as a control dependency.
    pub(crate) fn dependency(&self) -> Option<Arc<dyn crate::graph::Dependency>> {
        match self {
            Self::Value(output) => Some(output.as_dependency()),
            Self::Op(op) => Some(op.as_dependency()),
            _ => None,
        }
    }
}

impl<V: ReplicaValue> Placed for Item<V> {
    fn device(&self) -> Option<Device> {
        match self {
            Self::Value(output) => output.device().cloned(),
            Self::Op(op) => op.device().cloned(),
            Self::Component(component) => Some(component.device().clone()),
            Self::Variable(variable) => Some(variable.primary().device().clone()),
            Self::Aggregating(variable) => Some(variable.device().clone()),
            Self::PerReplica(values) => values.inner().primary().device(),
            Self::Mirrored(values) => values.primary().device(),
        }
    }
}

impl<V: ReplicaValue> Placed for ComponentVariable<V> {
    fn device(&self) -> Option<Device> {
        Some(ComponentVariable::device(self).clone())
    }
}

impl<V: ReplicaValue> Placed for Output<V> {
    fn device(&self) -> Option<Device> {
        Output::device(self).cloned()
    }
}

macro_rules! unplaced {
    ($($ty:ty),*) => {
        $(impl Placed for $ty {
            fn device(&self) -> Option<Device> {
                None
            }
        })*
    };
}

unplaced!(f32, f64, i32, i64);

impl<V: ReplicaValue> fmt::Debug for Item<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(output) => output.fmt(f),
            Self::Op(op) => op.fmt(f),
            Self::Component(component) => component.fmt(f),
            Self::Variable(variable) => variable.fmt(f),
            Self::Aggregating(variable) => variable.fmt(f),
            Self::PerReplica(values) => values.fmt(f),
            Self::Mirrored(values) => values.fmt(f),
        }
    }
}
