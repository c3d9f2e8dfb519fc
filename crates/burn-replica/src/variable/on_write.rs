use crate::context::Context;
use crate::error::{ReplicaError, Result};
use crate::graph::Output;
use crate::nest::Nest;
use crate::value::{Aggregation, ReplicaValue, is_floating};
use crate::values::Item;

use super::{DistributedVariable, UpdateKind, aggregation_error, apply_aggregation};

/// Cross-replica reads return a snapshot of the closest component, never the
/// component itself, so writes cannot bypass aggregation.
pub(super) fn get_cross_replica<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
) -> Result<Item<V>> {
    let component = variable.closest(ctx);
    Ok(Item::Value(Output::ready(
        Some(component.device().clone()),
        component.read()?,
    )))
}

pub(super) fn update<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
    value: Item<V>,
    kind: UpdateKind,
) -> Result<Item<V>> {
    if ctx.in_cross_replica_context() {
        if !variable.in_accelerator(ctx) {
            if let Some(id) = ctx.update_replica_id() {
                let component = variable.inner().replica(id)?;
                return kind.apply(component, value.evaluate(ctx)?).map(Item::Value);
            }
        }
        return update_cross_replica(variable, ctx, &value, kind);
    }

    ctx.assert_replica_context(variable.strategy().as_ref(), variable.name())?;
    update_replica(variable, ctx, value, kind)
}

fn update_cross_replica<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
    value: &Item<V>,
    kind: UpdateKind,
) -> Result<Item<V>> {
    variable
        .strategy()
        .update(ctx, variable.values(), value, &|_, component, value| {
            kind.apply(component, value)
        })
}

/// Every replica contributes its value to a merge. The merge aggregates the
/// contributions once and writes the result to every component.
fn update_replica<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
    value: Item<V>,
    kind: UpdateKind,
) -> Result<Item<V>> {
    let aggregation = variable.aggregation();
    if aggregation == Aggregation::None {
        return Err(ReplicaError::usage(aggregation_error("MirroredVariable")));
    }

    let merged = ctx.merge_call(Nest::Leaf(value), &|merge_ctx, grouped| {
        let value = grouped
            .into_leaf()
            .ok_or_else(|| ReplicaError::usage("A variable update contributes a single value"))?;

        // Only values that actually differ across replicas lose precision.
        if aggregation == Aggregation::Mean
            && !is_floating(variable.dtype())
            && matches!(value, Item::PerReplica(_))
        {
            return Err(ReplicaError::PrecisionGuard(format!(
                "Cannot update non-float variable {} with MEAN aggregation in replica context. \
                 Either change the variable dtype to float or update it in cross-replica context",
                variable.name()
            )));
        }

        let destinations: Vec<_> = variable
            .values()
            .iter()
            .map(|component| component.device().clone())
            .collect();
        let aggregated = apply_aggregation(merge_ctx, value, aggregation, &destinations)?;
        log::debug!(
            "Applying {} of {} aggregated with {aggregation}",
            kind.name(),
            variable.common_name()
        );
        update_cross_replica(variable, merge_ctx, &aggregated, kind).map(Nest::Leaf)
    })?;

    merged
        .into_leaf()
        .ok_or_else(|| ReplicaError::usage("A variable update returns a single value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;
    use crate::strategy::LocalStrategy;
    use crate::variable::VariableOptions;
    use std::sync::Arc;

    fn strategy<V: ReplicaValue>(n: usize) -> Arc<LocalStrategy<V>> {
        LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
    }

    fn read_all<V: ReplicaValue>(variable: &DistributedVariable<V>) -> Vec<V> {
        variable.values().iter().map(|c| c.read().unwrap()).collect()
    }

    #[test]
    fn test_cross_replica_assign_writes_every_component() {
        let strategy = strategy::<f32>(3);
        let variable = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();
        let ctx = strategy.scope();

        let result = variable.assign(&ctx, Item::value(5.0, None)).unwrap();
        assert_eq!(result.kind(), "Mirrored");
        assert_eq!(read_all(&variable), vec![5.0; 3]);
    }

    #[test]
    fn test_update_replica_writes_only_its_component() {
        let strategy = strategy::<f32>(2);
        let variable = strategy.create_variable(VariableOptions::new(), 1.0).unwrap();
        let ctx = strategy.scope().with_update_replica(1);

        variable.assign_add(&ctx, Item::value(2.0, None)).unwrap();
        assert_eq!(read_all(&variable), vec![1.0, 3.0]);
    }

    #[test]
    fn test_only_first_replica_broadcasts_replica_zero() {
        let strategy = strategy::<f32>(3);
        let variable = strategy
            .create_variable(
                VariableOptions::new().with_aggregation(Aggregation::OnlyFirstReplica),
                0.0,
            )
            .unwrap();

        strategy
            .run(|ctx| {
                let id = ctx.current_replica_id().unwrap();
                variable
                    .assign(ctx, Item::value(10.0 + id as f32, ctx.device().cloned()))
                    .map(Nest::Leaf)
            })
            .unwrap();
        assert_eq!(read_all(&variable), vec![10.0; 3]);
    }

    #[test]
    #[should_panic = "You must specify an aggregation method to update a MirroredVariable in replica context"]
    fn test_replica_update_without_aggregation() {
        let strategy = strategy::<f32>(2);
        let variable = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();

        strategy
            .run(|ctx| variable.assign(ctx, Item::value(1.0, None)).map(Nest::Leaf))
            .unwrap();
    }

    #[test]
    #[should_panic = "PrecisionGuard"]
    fn test_mean_of_divergent_integers_is_rejected() {
        let strategy = strategy::<i32>(2);
        let variable = strategy
            .create_variable(VariableOptions::new().with_aggregation(Aggregation::Mean), 0)
            .unwrap();

        strategy
            .run(|ctx| {
                let id = ctx.current_replica_id().unwrap() as i32;
                variable.assign(ctx, Item::value(id, None)).map(Nest::Leaf)
            })
            .unwrap();
    }

    #[test]
    fn test_mean_of_shared_integer_is_allowed() {
        let strategy = strategy::<i32>(2);
        let variable = strategy
            .create_variable(VariableOptions::new().with_aggregation(Aggregation::Mean), 0)
            .unwrap();
        let shared = Item::value(4, None);

        strategy
            .run(|ctx| variable.assign(ctx, shared.clone()).map(Nest::Leaf))
            .unwrap();
        assert_eq!(read_all(&variable), vec![4, 4]);
    }
}
