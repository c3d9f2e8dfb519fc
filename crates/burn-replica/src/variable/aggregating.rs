use burn_tensor::DType;
use core::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::graph::{Op, Output};
use crate::nest::Nest;
use crate::strategy::Strategy;
use crate::value::{Aggregation, ReplicaValue};
use crate::values::Item;

use super::{ComponentVariable, UpdateKind, aggregation_error, apply_aggregation};

struct AggregatingInner<V: ReplicaValue> {
    strategy: Arc<dyn Strategy<V>>,
    component: ComponentVariable<V>,
    aggregation: Aggregation,
}

/// A single variable whose replica-context updates are aggregated across
/// replicas before being applied once, e.g. an optimizer step counter.
pub struct AggregatingVariable<V: ReplicaValue> {
    inner: Arc<AggregatingInner<V>>,
}

impl<V: ReplicaValue> Clone for AggregatingVariable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: ReplicaValue> AggregatingVariable<V> {
    /// Wraps `component`, owned by `strategy`.
    pub fn new(strategy: Arc<dyn Strategy<V>>, component: ComponentVariable<V>, aggregation: Aggregation) -> Self {
        Self {
            inner: Arc::new(AggregatingInner {
                strategy,
                component,
                aggregation,
            }),
        }
    }

    /// The wrapped variable.
    pub fn component(&self) -> &ComponentVariable<V> {
        &self.inner.component
    }

    /// The strategy that owns the variable.
    pub fn strategy(&self) -> &Arc<dyn Strategy<V>> {
        &self.inner.strategy
    }

    /// How replica-context updates are combined.
    pub fn aggregation(&self) -> Aggregation {
        self.inner.aggregation
    }

    /// The component's name.
    pub fn name(&self) -> &str {
        self.inner.component.name()
    }

    /// The component's device.
    pub fn device(&self) -> &Device {
        self.inner.component.device()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.inner.component.dtype()
    }

    /// Dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.inner.component.shape()
    }

    /// Whether the variable is trained.
    pub fn trainable(&self) -> bool {
        self.inner.component.trainable()
    }

    /// Whether the component holds a value.
    pub fn is_initialized(&self) -> Output<bool> {
        self.inner.component.is_initialized()
    }

    /// The component's initializer.
    pub fn initializer(&self) -> Op {
        self.inner.component.initializer()
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current value.
    pub fn read_value(&self) -> Result<V> {
        self.inner.component.read()
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
        let strategy = self.inner.strategy.as_ref();
        let component = &self.inner.component;
        let ctx = ctx.enter_strategy_of(strategy, component.name())?;

        if ctx.in_cross_replica_context() {
            if ctx.update_replica_id().is_some() {
                return kind.apply(component, value.evaluate(&ctx)?).map(Item::Value);
            }
            return strategy.update(&ctx, core::slice::from_ref(component), &value, &|_, c, v| {
                kind.apply(c, v)
            });
        }

        ctx.assert_replica_context(strategy, component.name())?;
        if self.inner.aggregation == Aggregation::None {
            return Err(ReplicaError::usage(aggregation_error("AggregatingVariable")));
        }

        let aggregation = self.inner.aggregation;
        let merged = ctx.merge_call(Nest::Leaf(value), &|merge_ctx, grouped| {
            let value = grouped
                .into_leaf()
                .ok_or_else(|| ReplicaError::usage("A variable update contributes a single value"))?;
            let aggregated =
                apply_aggregation(merge_ctx, value, aggregation, &[component.device().clone()])?;
            strategy
                .update(merge_ctx, core::slice::from_ref(component), &aggregated, &|_, c, v| {
                    kind.apply(c, v)
                })
                .map(Nest::Leaf)
        })?;

        merged
            .into_leaf()
            .ok_or_else(|| ReplicaError::usage("A variable update returns a single value"))
    }
}

impl<V: ReplicaValue> fmt::Debug for AggregatingVariable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatingVariable")
            .field("component", &self.inner.component)
            .field("aggregation", &self.inner.aggregation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;
    use crate::strategy::LocalStrategy;

    fn counter(n: usize, aggregation: Aggregation) -> (Arc<LocalStrategy<i64>>, AggregatingVariable<i64>) {
        let strategy = LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap());
        let component = ComponentVariable::new("iterations:0", Device::cpu(0), 0i64, false);
        let variable = AggregatingVariable::new(strategy.clone(), component, aggregation);
        (strategy, variable)
    }

    #[test]
    fn test_replica_increments_are_aggregated_once() {
        let (strategy, variable) = counter(4, Aggregation::OnlyFirstReplica);
        let one = Item::value(1, None);

        let result = strategy
            .run(|ctx| variable.assign_add(ctx, one.clone()).map(Nest::Leaf))
            .unwrap();

        assert_eq!(variable.read_value().unwrap(), 1);
        assert_eq!(result.as_leaf().unwrap().kind(), "Value");
    }

    #[test]
    fn test_sum_of_contributions() {
        let (strategy, variable) = counter(3, Aggregation::Sum);

        strategy
            .run(|ctx| {
                let id = ctx.current_replica_id().unwrap() as i64;
                variable.assign_add(ctx, Item::value(id, None)).map(Nest::Leaf)
            })
            .unwrap();
        assert_eq!(variable.read_value().unwrap(), 3);
    }

    #[test]
    fn test_cross_replica_update() {
        let (strategy, variable) = counter(2, Aggregation::Sum);

        variable.assign(&strategy.scope(), Item::value(5, None)).unwrap();
        assert_eq!(variable.read_value().unwrap(), 5);
    }

    #[test]
    #[should_panic = "You must specify an aggregation method to update a AggregatingVariable"]
    fn test_replica_update_needs_aggregation() {
        let (strategy, variable) = counter(2, Aggregation::None);

        strategy
            .run(|ctx| variable.assign(ctx, Item::value(1, None)).map(Nest::Leaf))
            .unwrap();
    }
}
