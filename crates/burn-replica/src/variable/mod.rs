//! Distributed variables: one logical variable backed by one physical component
//! per replica.
//!
//! A [`DistributedVariable`] combines a synchronization policy ([`SyncPolicy`]),
//! deciding when replicas are reconciled, with a platform ([`Platform`]), deciding
//! how handles are resolved. The policy and the platform vary independently.

mod accelerator;
mod aggregating;
mod component;
mod creation;
mod on_read;
mod on_write;

pub use accelerator::{AcceleratorContext, HandleCache, ReplicatedHandle, VariableHandle};
pub use aggregating::AggregatingVariable;
pub use component::{ComponentId, ComponentVariable, UpdateKind};
pub use creation::{Platform, VariableOptions, make_distributed_variable, replicated_creator};

use burn_tensor::DType;
use core::fmt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::context::Context;
use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::graph::{Op, Output, group};
use crate::regroup::select_item;
use crate::strategy::Strategy;
use crate::value::{Aggregation, ReduceOp, ReplicaValue, Synchronization};
use crate::values::{DistributedValues, Item, Placed, write_values};

/// When the replicas of a distributed variable are reconciled.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum SyncPolicy {
    /// Every write is aggregated and applied to all replicas.
    OnWrite,
    /// Writes stay local; replicas are reduced when read across replicas.
    OnRead,
}

pub(crate) struct VariableInner<V: ReplicaValue> {
    strategy: Arc<dyn Strategy<V>>,
    values: DistributedValues<ComponentVariable<V>>,
    common_name: String,
    aggregation: Aggregation,
    policy: SyncPolicy,
    platform: Platform,
    initializer_override: Mutex<Option<Op>>,
}

impl<V: ReplicaValue> Drop for VariableInner<V> {
    fn drop(&mut self) {
        self.strategy
            .registry()
            .release(self.values.values().iter().map(ComponentVariable::id));
    }
}

/// A logical variable with one physical component per replica.
///
/// In a replica context, reads and writes resolve to the replica's own component.
/// In cross-replica context the behaviour depends on the [`SyncPolicy`]: mirrored
/// variables read any component (they are kept equal) and write all of them,
/// sync-on-read variables reduce their components on read.
pub struct DistributedVariable<V: ReplicaValue> {
    inner: Arc<VariableInner<V>>,
}

impl<V: ReplicaValue> Clone for DistributedVariable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A non-owning reference to a [`DistributedVariable`].
pub struct WeakVariable<V: ReplicaValue> {
    inner: Weak<VariableInner<V>>,
}

impl<V: ReplicaValue> Clone for WeakVariable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: ReplicaValue> WeakVariable<V> {
    /// The variable, if it is still alive.
    pub fn upgrade(&self) -> Option<DistributedVariable<V>> {
        self.inner.upgrade().map(|inner| DistributedVariable { inner })
    }

    /// Whether the variable was dropped.
    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Whether this refers to `variable`.
    pub fn refers_to(&self, variable: &DistributedVariable<V>) -> bool {
        core::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&variable.inner))
    }
}

impl<V: ReplicaValue> DistributedVariable<V> {
    pub(crate) fn from_parts(
        strategy: Arc<dyn Strategy<V>>,
        values: DistributedValues<ComponentVariable<V>>,
        aggregation: Aggregation,
        policy: SyncPolicy,
        platform: Platform,
    ) -> Self {
        let common_name = values
            .primary()
            .name()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            inner: Arc::new(VariableInner {
                strategy,
                values,
                common_name,
                aggregation,
                policy,
                platform,
                initializer_override: Mutex::new(None),
            }),
        }
    }

    /// The strategy that created the variable.
    pub fn strategy(&self) -> &Arc<dyn Strategy<V>> {
        &self.inner.strategy
    }

    /// The components, in replica order.
    pub fn values(&self) -> &[ComponentVariable<V>] {
        self.inner.values.values()
    }

    /// The underlying container.
    pub fn inner(&self) -> &DistributedValues<ComponentVariable<V>> {
        &self.inner.values
    }

    /// Replica 0's component, the source of the variable's metadata.
    pub fn primary(&self) -> &ComponentVariable<V> {
        self.inner.values.primary()
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A non-owning reference to this variable.
    pub fn downgrade(&self) -> WeakVariable<V> {
        WeakVariable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The primary's full name.
    pub fn name(&self) -> &str {
        self.primary().name()
    }

    /// The primary's name without its output suffix, shared by all replicas.
    pub fn common_name(&self) -> &str {
        &self.inner.common_name
    }

    /// Same as [`DistributedVariable::common_name`].
    pub fn shared_name(&self) -> &str {
        &self.inner.common_name
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.primary().dtype()
    }

    /// Dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.primary().shape()
    }

    /// Whether the variable is trained.
    pub fn trainable(&self) -> bool {
        self.primary().trainable()
    }

    /// The primary's id.
    pub fn unique_id(&self) -> ComponentId {
        self.primary().id()
    }

    /// The primary's initial value.
    pub fn initial_value(&self) -> &V {
        self.primary().initial_value()
    }

    /// How replica-context updates are combined.
    pub fn aggregation(&self) -> Aggregation {
        self.inner.aggregation
    }

    /// When replicas are reconciled.
    pub fn policy(&self) -> SyncPolicy {
        self.inner.policy
    }

    /// The policy as a [`Synchronization`].
    pub fn synchronization(&self) -> Synchronization {
        match self.inner.policy {
            SyncPolicy::OnWrite => Synchronization::OnWrite,
            SyncPolicy::OnRead => Synchronization::OnRead,
        }
    }

    /// How handles are resolved.
    pub fn platform(&self) -> Platform {
        self.inner.platform
    }

    /// Stable id of the variable in accelerator handle caches. Same-named variables
    /// created separately get different ids.
    pub fn handle_id(&self) -> String {
        format!("{}_{}", self.inner.common_name, self.unique_id())
    }

    /// The device of the component [`DistributedVariable::closest`] resolves to.
    pub fn device(&self, ctx: &Context<'_, V>) -> Device {
        self.closest(ctx).device().clone()
    }

    pub(crate) fn in_accelerator(&self, ctx: &Context<'_, V>) -> bool {
        self.inner.platform == Platform::Accelerator && ctx.accelerator().is_some()
    }

    /// The component of the current replica; in cross-replica context the one on
    /// the current device, or the primary. Inside an accelerator context always
    /// the primary.
    pub fn closest(&self, ctx: &Context<'_, V>) -> &ComponentVariable<V> {
        if self.in_accelerator(ctx) {
            return self.primary();
        }
        self.inner.values.closest(ctx)
    }

    /// The current replica's component, or the cross-replica value of the policy.
    pub fn get(&self, ctx: &Context<'_, V>) -> Result<Item<V>> {
        if self.in_accelerator(ctx) {
            return Err(ReplicaError::capability(format!(
                "Variable {} cannot be resolved to a replica inside an accelerator context, use read_value instead",
                self.name()
            )));
        }
        match ctx.current_replica_id() {
            Some(id) => self.inner.values.replica(id).cloned().map(Item::Component),
            None => self.get_cross_replica(ctx),
        }
    }

    /// The value seen by cross-replica code.
    pub fn get_cross_replica(&self, ctx: &Context<'_, V>) -> Result<Item<V>> {
        match self.inner.policy {
            SyncPolicy::OnWrite => on_write::get_cross_replica(self, ctx),
            SyncPolicy::OnRead => on_read::get_cross_replica(self, ctx),
        }
    }

    /// A snapshot of the value, entering the variable's strategy scope if none is
    /// active.
    pub fn read_value(&self, ctx: &Context<'_, V>) -> Result<Output<V>> {
        let ctx = ctx.enter_strategy_of(self.inner.strategy.as_ref(), self.common_name())?;
        if self.in_accelerator(&ctx) {
            let value = self.handle(&ctx)?.read(&ctx)?;
            return Ok(Output::ready(ctx.device().cloned(), value));
        }

        match self.get(&ctx)? {
            Item::Value(output) => Ok(output.identity(output.device().cloned(), &[])),
            other => Ok(Output::ready(Placed::device(&other), other.evaluate(&ctx)?)),
        }
    }

    /// The physical handle of the current replica, or inside an accelerator
    /// context the replicated handle of the whole variable.
    pub fn handle(&self, ctx: &Context<'_, V>) -> Result<VariableHandle<V>> {
        if let (Platform::Accelerator, Some(cache)) = (self.inner.platform, ctx.accelerator()) {
            let is_mirrored = self.inner.policy == SyncPolicy::OnWrite;
            return Ok(VariableHandle::Replicated(cache.replicated_handle(
                &self.handle_id(),
                self.values(),
                is_mirrored,
            )));
        }
        match ctx.current_replica_id() {
            Some(id) => self
                .inner
                .values
                .replica(id)
                .cloned()
                .map(VariableHandle::Component),
            None => Err(ReplicaError::usage(
                "DistributedVariable.handle is not available outside the replica context or a Strategy::update call",
            )),
        }
    }

    /// The plain form of the variable. Inside an accelerator context there is
    /// none.
    pub fn as_graph_element(&self, ctx: &Context<'_, V>) -> Result<Option<Item<V>>> {
        if self.in_accelerator(ctx) {
            return Ok(None);
        }
        match self.inner.policy {
            SyncPolicy::OnRead if ctx.in_cross_replica_context() => {
                self.get_cross_replica(ctx).map(Some)
            }
            _ => Ok(Some(Item::Component(self.closest(ctx).clone()))),
        }
    }

    /// Whether every component is initialized. The final conjunction carries
    /// `name`.
    pub fn is_initialized(&self, name: Option<&str>) -> Output<bool> {
        let values = self.values();
        let mut result = self.primary().is_initialized();
        for component in values.get(1..values.len() - 1).unwrap_or_default() {
            result = logical_and(None, result, component.is_initialized());
        }
        let last = values.last().unwrap_or_else(|| self.primary());
        logical_and(name, result, last.is_initialized())
    }

    /// The override set by [`DistributedVariable::set_initializer`], or a group
    /// of every component's initializer.
    pub fn initializer(&self) -> Op {
        if let Some(op) = self.inner.initializer_override.lock().as_ref() {
            return op.clone();
        }
        group(
            self.values()
                .iter()
                .map(|component| component.initializer().as_dependency())
                .collect(),
        )
    }

    /// Replaces the initializer, e.g. with a restore op.
    pub fn set_initializer(&self, op: Op) {
        *self.inner.initializer_override.lock() = Some(op);
    }

    /// Fails unless the variable was created by `strategy`.
    pub fn validate_colocate(&self, strategy: &dyn Strategy<V>) -> Result<()> {
        if self.inner.strategy.id() != strategy.id() {
            return Err(ReplicaError::usage(format!(
                "colocate_vars_with must only be passed a variable created in the scope of {}, not {} created in the scope of {}",
                strategy.describe(),
                self.name(),
                self.inner.strategy.describe()
            )));
        }
        Ok(())
    }

    /// Replaces the value.
    pub fn assign(&self, ctx: &Context<'_, V>, value: Item<V>) -> Result<Item<V>> {
        self.update(ctx, value, UpdateKind::Assign)
    }

    /// Adds to the value.
    pub fn assign_add(&self, ctx: &Context<'_, V>, value: Item<V>) -> Result<Item<V>> {
        self.update(ctx, value, UpdateKind::AssignAdd)
    }

    /// Subtracts from the value.
    pub fn assign_sub(&self, ctx: &Context<'_, V>, value: Item<V>) -> Result<Item<V>> {
        self.update(ctx, value, UpdateKind::AssignSub)
    }

    fn update(&self, ctx: &Context<'_, V>, value: Item<V>, kind: UpdateKind) -> Result<Item<V>> {
        let ctx = ctx.enter_strategy_of(self.inner.strategy.as_ref(), self.common_name())?;
        match self.inner.policy {
            SyncPolicy::OnWrite => on_write::update(self, &ctx, value, kind),
            SyncPolicy::OnRead => on_read::update(self, &ctx, value, kind),
        }
    }

    fn kind_name(&self) -> &'static str {
        match (self.inner.platform, self.inner.policy) {
            (Platform::Host, SyncPolicy::OnWrite) => "MirroredVariable",
            (Platform::Host, SyncPolicy::OnRead) => "SyncOnReadVariable",
            (Platform::Accelerator, SyncPolicy::OnWrite) => "AcceleratorMirroredVariable",
            (Platform::Accelerator, SyncPolicy::OnRead) => "AcceleratorSyncOnReadVariable",
        }
    }
}

fn logical_and(name: Option<&str>, lhs: Output<bool>, rhs: Output<bool>) -> Output<bool> {
    Output::named_fn(name, None, Vec::new(), move || lhs.evaluate() && rhs.evaluate())
}

impl<V: ReplicaValue> fmt::Debug for DistributedVariable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_values(f, self.kind_name(), self.values())
    }
}

impl<V: ReplicaValue> fmt::Display for DistributedVariable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fails unless `item` is a distributed variable created by `strategy`.
pub fn validate_colocate_distributed_variable<V: ReplicaValue>(
    item: &Item<V>,
    strategy: &dyn Strategy<V>,
) -> Result<()> {
    match item {
        Item::Variable(variable) => variable.validate_colocate(strategy),
        other => Err(ReplicaError::usage(format!(
            "colocate_vars_with must only be passed a variable created in the scope of {}, not a {}",
            strategy.describe(),
            other.kind()
        ))),
    }
}

/// Whether `item` is a distributed variable.
pub fn is_distributed_variable<V: ReplicaValue>(item: &Item<V>) -> bool {
    matches!(item, Item::Variable(_))
}

pub(crate) fn aggregation_error(variable_type: &str) -> String {
    format!(
        "You must specify an aggregation method to update a {variable_type} in replica context. \
         You can do so by passing an explicit aggregation to VariableOptions::with_aggregation"
    )
}

/// Combines per-replica contributions per `aggregation` and places the result on
/// every destination.
pub(crate) fn apply_aggregation<V: ReplicaValue>(
    ctx: &Context<'_, V>,
    value: Item<V>,
    aggregation: Aggregation,
    destinations: &[Device],
) -> Result<Item<V>> {
    let strategy = ctx
        .strategy()
        .ok_or_else(|| ReplicaError::usage("Aggregation needs an active strategy scope"))?;
    if aggregation == Aggregation::OnlyFirstReplica {
        let first = select_item(0, &value)?;
        return strategy.broadcast_to(ctx, &first, destinations);
    }
    let op = ReduceOp::from_aggregation(aggregation)?;
    strategy.reduce_to(ctx, op, &value, destinations)
}
