use crate::context::Context;
use crate::error::{ReplicaError, Result};
use crate::graph::{Output, group};
use crate::value::{Aggregation, ReduceOp, ReplicaValue};
use crate::values::Item;

use super::{DistributedVariable, UpdateKind};

pub(super) fn get_cross_replica<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
) -> Result<Item<V>> {
    if variable.aggregation() == Aggregation::OnlyFirstReplica {
        return Ok(Item::Component(variable.primary().clone()));
    }

    let strategy = variable.strategy().as_ref();
    let ctx = ctx.enter_strategy_of(strategy, variable.common_name())?;
    let op = ReduceOp::from_aggregation(variable.aggregation())?;
    strategy
        .reduce(&ctx, op, &Item::Variable(variable.clone()))
        .map(Item::Value)
}

pub(super) fn update<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
    value: Item<V>,
    kind: UpdateKind,
) -> Result<Item<V>> {
    if variable.in_accelerator(ctx) {
        let value = value.evaluate(ctx)?;
        return variable.handle(ctx)?.apply(ctx, kind, value).map(Item::Value);
    }

    if ctx.in_cross_replica_context() {
        return update_cross_replica(variable, ctx, value, kind);
    }

    ctx.assert_replica_context(variable.strategy().as_ref(), variable.name())?;
    let component = variable.closest(ctx);
    kind.apply(component, value.evaluate(ctx)?).map(Item::Value)
}

/// Writes the same value to every component, without aggregation. An assign
/// under SUM splits the value evenly so the reduced total is what was assigned.
/// An update replica id does not narrow the write to one component.
fn update_cross_replica<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    ctx: &Context<'_, V>,
    value: Item<V>,
    kind: UpdateKind,
) -> Result<Item<V>> {
    let mut value = value.evaluate(ctx)?;
    if variable.aggregation() == Aggregation::Sum {
        match kind {
            UpdateKind::Assign => value = value.div_count(variable.values().len()),
            UpdateKind::AssignAdd | UpdateKind::AssignSub => {
                return Err(ReplicaError::capability(format!(
                    "SyncOnReadVariable does not support {} in cross-replica context when aggregation is SUM",
                    kind.name()
                )));
            }
        }
    }

    let updates = variable
        .values()
        .iter()
        .map(|component| kind.apply(component, value.clone()))
        .collect::<Result<Vec<_>>>()?;
    let barrier = group(updates.iter().map(Output::as_dependency).collect());

    let read = variable.read_value(ctx)?;
    Ok(Item::Value(read.identity(read.device().cloned(), &[barrier])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;
    use crate::nest::Nest;
    use crate::strategy::LocalStrategy;
    use crate::value::Synchronization;
    use crate::variable::VariableOptions;
    use std::sync::Arc;

    fn sync_on_read(n: usize, aggregation: Aggregation) -> (Arc<LocalStrategy<f32>>, DistributedVariable<f32>) {
        let strategy = LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap());
        let variable = strategy
            .create_variable(
                VariableOptions::new()
                    .with_name("metric")
                    .with_synchronization(Synchronization::OnRead)
                    .with_aggregation(aggregation),
                0.0,
            )
            .unwrap();
        (strategy, variable)
    }

    #[test]
    fn test_replica_writes_stay_local() {
        let (strategy, variable) = sync_on_read(3, Aggregation::Sum);

        strategy
            .run(|ctx| {
                let id = ctx.current_replica_id().unwrap();
                variable
                    .assign_add(ctx, Item::value(id as f32 + 1.0, None))
                    .map(Nest::Leaf)
            })
            .unwrap();

        let values: Vec<f32> = variable.values().iter().map(|c| c.read().unwrap()).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        let total = variable.read_value(&strategy.scope()).unwrap().evaluate();
        assert_eq!(total, 6.0);
    }

    #[test]
    fn test_cross_replica_assign_splits_sum() {
        let (strategy, variable) = sync_on_read(4, Aggregation::Sum);

        let read = variable.assign(&strategy.scope(), Item::value(8.0, None)).unwrap();
        assert_eq!(read.evaluate(&strategy.scope()).unwrap(), 8.0);
        assert_eq!(variable.values()[3].read().unwrap(), 2.0);
    }

    #[test]
    fn test_update_context_assign_fans_out() {
        let (strategy, variable) = sync_on_read(2, Aggregation::Sum);
        let ctx = strategy.scope().with_update_replica(1);

        let _read = variable.assign(&ctx, Item::value(8.0, None)).unwrap();
        let values: Vec<f32> = variable.values().iter().map(|c| c.read().unwrap()).collect();
        assert_eq!(values, vec![4.0, 4.0]);
    }

    #[test]
    #[should_panic = "SyncOnReadVariable does not support assign_add in cross-replica context"]
    fn test_update_context_assign_add_under_sum() {
        let (strategy, variable) = sync_on_read(2, Aggregation::Sum);
        let ctx = strategy.scope().with_update_replica(1);

        let _read = variable.assign_add(&ctx, Item::value(1.0, None)).unwrap();
    }

    #[test]
    fn test_mean_reads_average() {
        let (strategy, variable) = sync_on_read(2, Aggregation::Mean);
        variable.values()[0].assign(1.0).unwrap();
        variable.values()[1].assign(3.0).unwrap();

        assert_eq!(variable.read_value(&strategy.scope()).unwrap().evaluate(), 2.0);
    }

    #[test]
    fn test_only_first_replica_reads_primary() {
        let (strategy, variable) = sync_on_read(2, Aggregation::OnlyFirstReplica);
        variable.values()[1].assign(7.0).unwrap();

        let read = variable.get_cross_replica(&strategy.scope()).unwrap();
        assert_eq!(read.evaluate(&strategy.scope()).unwrap(), 0.0);
    }

    #[test]
    #[should_panic = "SyncOnReadVariable does not support assign_sub in cross-replica context"]
    fn test_cross_replica_assign_sub_under_sum() {
        let (strategy, variable) = sync_on_read(2, Aggregation::Sum);
        let _read = variable.assign_sub(&strategy.scope(), Item::value(1.0, None)).unwrap();
    }
}
