use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;

use crate::context::{Context, MergeCall, MergeFn};
use crate::device::{Device, DeviceSet};
use crate::error::{ReplicaError, Result};
use crate::graph::Output;
use crate::nest::Nest;
use crate::regroup::{regroup, select_item, select_replica, update_regroup};
use crate::value::{ReduceOp, ReplicaValue};
use crate::values::{Item, Mirrored};
use crate::variable::{
    ComponentId, ComponentVariable, DistributedVariable, VariableOptions, WeakVariable,
    make_distributed_variable, replicated_creator,
};

/// Identifies one strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrategyId(u64);

impl StrategyId {
    /// A process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Applies an update to one component, returning the value read after the update.
pub type UpdateFn<'f, V> =
    dyn Fn(&Context<'_, V>, &ComponentVariable<V>, V) -> Result<Output<V>> + Sync + 'f;

/// Decides how many replicas exist, where they live, and how values move between
/// them.
///
/// Distributed values and variables only consume this interface. Two strategies are
/// the same when their ids match.
pub trait Strategy<V: ReplicaValue>: Send + Sync {
    /// The instance id.
    fn id(&self) -> StrategyId;

    /// A human readable name.
    fn name(&self) -> &str;

    /// Name and id, for error messages.
    fn describe(&self) -> String {
        format!("{}{}", self.name(), self.id())
    }

    /// One device per replica, in replica order.
    fn devices(&self) -> &[Device];

    /// Number of replicas kept in sync.
    fn num_replicas_in_sync(&self) -> usize {
        self.devices().len()
    }

    /// The side-table from components to the variables that own them.
    fn registry(&self) -> &ContainerRegistry<V>;

    /// Runs `f` on every component with the matching replica's slice of `value`,
    /// in cross-replica context. The result completes only once every component
    /// was updated.
    fn update(
        &self,
        ctx: &Context<'_, V>,
        components: &[ComponentVariable<V>],
        value: &Item<V>,
        f: &UpdateFn<'_, V>,
    ) -> Result<Item<V>>;

    /// Reduces a per-replica value and places the result on every destination.
    fn reduce_to(
        &self,
        ctx: &Context<'_, V>,
        op: ReduceOp,
        value: &Item<V>,
        destinations: &[Device],
    ) -> Result<Item<V>>;

    /// Copies a single value to every destination.
    fn broadcast_to(&self, ctx: &Context<'_, V>, value: &Item<V>, destinations: &[Device]) -> Result<Item<V>>;

    /// Reduces a per-replica value to one value on the current device.
    fn reduce(&self, ctx: &Context<'_, V>, op: ReduceOp, value: &Item<V>) -> Result<Output<V>>;

    /// Reads the cross-replica value of a variable.
    fn read_var(&self, ctx: &Context<'_, V>, variable: &DistributedVariable<V>) -> Result<Output<V>>;
}

/// Maps component ids to the distributed variable that owns them.
///
/// The mapping never owns the variables: a variable that was dropped simply
/// stops resolving.
pub struct ContainerRegistry<V: ReplicaValue> {
    containers: RwLock<HashMap<ComponentId, WeakVariable<V>>>,
}

impl<V: ReplicaValue> Default for ContainerRegistry<V> {
    fn default() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: ReplicaValue> ContainerRegistry<V> {
    /// Records `variable` as the owner of each of its components. A component
    /// keeps a single live owner, so claiming one owned by another variable
    /// fails and registers nothing.
    pub fn register(&self, variable: &DistributedVariable<V>) -> Result<()> {
        let mut containers = self.containers.write();
        for component in variable.values() {
            let owned_elsewhere = containers
                .get(&component.id())
                .is_some_and(|owner| !owner.is_dropped() && !owner.refers_to(variable));
            if owned_elsewhere {
                return Err(ReplicaError::usage(format!(
                    "Component {} is already owned by another distributed variable",
                    component.name()
                )));
            }
        }
        for component in variable.values() {
            containers.insert(component.id(), variable.downgrade());
        }
        Ok(())
    }

    /// Forgets the given components, keeping those a live variable owns.
    pub fn release(&self, ids: impl IntoIterator<Item = ComponentId>) {
        let mut containers = self.containers.write();
        for id in ids {
            if containers.get(&id).is_some_and(WeakVariable::is_dropped) {
                containers.remove(&id);
            }
        }
    }

    /// Whether `component` was registered by a variable, alive or not.
    pub fn contains(&self, component: &ComponentVariable<V>) -> bool {
        self.containers.read().contains_key(&component.id())
    }

    /// The live variable owning `component`.
    pub fn container_of(&self, component: &ComponentVariable<V>) -> Option<DistributedVariable<V>> {
        let weak = self.containers.read().get(&component.id()).cloned()?;
        let container = weak.upgrade();
        if container.is_none() {
            log::warn!(
                "Container of component {} was dropped before the lookup",
                component.name()
            );
        }
        container
    }
}

/// Runs one replica per device on its own thread, in a single process.
///
/// This is the reference [`Strategy`]: reductions and broadcasts are computed on
/// the host, and merge points are a rendezvous of the replica threads.
pub struct LocalStrategy<V: ReplicaValue> {
    id: StrategyId,
    name: String,
    devices: DeviceSet,
    registry: ContainerRegistry<V>,
}

impl<V: ReplicaValue> LocalStrategy<V> {
    /// A strategy with one replica per device of `devices`.
    pub fn new(devices: DeviceSet) -> Arc<Self> {
        Self::named("LocalStrategy", devices)
    }

    /// Like [`LocalStrategy::new`] with a custom name.
    pub fn named(name: impl Into<String>, devices: DeviceSet) -> Arc<Self> {
        Arc::new(Self {
            id: StrategyId::next(),
            name: name.into(),
            devices,
            registry: ContainerRegistry::default(),
        })
    }

    /// Cross-replica context inside this strategy's scope.
    pub fn scope(&self) -> Context<'_, V> {
        Context::scoped(self)
    }

    /// Creates a distributed variable initialized to `initial_value` on every replica.
    pub fn create_variable(self: &Arc<Self>, options: VariableOptions, initial_value: V) -> Result<DistributedVariable<V>> {
        let strategy: Arc<dyn Strategy<V>> = self.clone();
        make_distributed_variable(&strategy, replicated_creator(initial_value), options)
    }

    /// Runs `f` once per replica, each on its own thread with its own replica
    /// context, and regroups the per-replica results.
    ///
    /// If a replica fails, replicas waiting at a merge point are released with
    /// [`ReplicaError::Aborted`] and the first failure is returned.
    pub fn run<F>(&self, f: F) -> Result<Nest<Item<V>>>
    where
        F: Fn(&Context<'_, V>) -> Result<Nest<Item<V>>> + Sync,
    {
        let num_replicas = self.devices.len();
        let rendezvous = Rendezvous::new(num_replicas);

        let results: Vec<Result<Nest<Item<V>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_replicas)
                .map(|id| {
                    let rendezvous = &rendezvous;
                    let f = &f;
                    scope.spawn(move || {
                        let _guard = AbortOnPanic { rendezvous, id };
                        let ctx = Context::replica(self, id, rendezvous);
                        let result = f(&ctx);
                        if let Err(err) = &result {
                            rendezvous.abort(id, err);
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut outputs = Vec::with_capacity(num_replicas);
        let mut aborted = None;
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(err @ ReplicaError::Aborted { .. }) => aborted = Some(err),
                Err(err) => return Err(err),
            }
        }
        if let Some(err) = aborted {
            return Err(err);
        }

        regroup(outputs, &self.registry)
    }

    fn local_values(&self, ctx: &Context<'_, V>, value: &Item<V>) -> Result<Vec<V>> {
        let cross = Context::scoped(self);
        let cross = match ctx.accelerator() {
            Some(cache) => cross.in_accelerator(cache),
            None => cross,
        };
        match value {
            Item::PerReplica(values) => values
                .values()
                .iter()
                .map(|item| item.evaluate(&cross))
                .collect(),
            Item::Mirrored(values) => values
                .values()
                .iter()
                .map(|item| item.evaluate(&cross))
                .collect(),
            Item::Variable(variable) => variable
                .values()
                .iter()
                .map(ComponentVariable::read)
                .collect(),
            other => Ok(vec![other.evaluate(&cross)?]),
        }
    }

    fn reduce_values(&self, ctx: &Context<'_, V>, op: ReduceOp, value: &Item<V>) -> Result<V> {
        let distributed = matches!(
            value,
            Item::PerReplica(_) | Item::Mirrored(_) | Item::Variable(_)
        );
        if !distributed && op == ReduceOp::Sum && self.num_replicas_in_sync() > 1 {
            return Err(ReplicaError::capability(format!(
                "A non-distributed {} cannot be reduced with {:?} across {} replicas",
                value.kind(),
                op,
                self.num_replicas_in_sync()
            )));
        }
        let values = self.local_values(ctx, value)?;
        op.apply(&values)
    }

    fn mirrored_on(&self, value: V, destinations: &[Device]) -> Result<Item<V>> {
        let destinations = match destinations {
            [] => self.devices.devices(),
            some => some,
        };
        let outputs = destinations
            .iter()
            .map(|device| Item::value(value.clone(), Some(device.clone())))
            .collect();
        Mirrored::new(outputs).map(Item::Mirrored)
    }
}

impl<V: ReplicaValue> Strategy<V> for LocalStrategy<V> {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> &[Device] {
        self.devices.devices()
    }

    fn registry(&self) -> &ContainerRegistry<V> {
        &self.registry
    }

    fn update(
        &self,
        ctx: &Context<'_, V>,
        components: &[ComponentVariable<V>],
        value: &Item<V>,
        f: &UpdateFn<'_, V>,
    ) -> Result<Item<V>> {
        let ctx = ctx.enter_or_assert_strategy(self)?;

        let mut updates = Vec::with_capacity(components.len());
        for (i, component) in components.iter().enumerate() {
            let update_ctx = ctx
                .with_update_replica(i)
                .on_device(component.device().clone());
            let arg = select_item(i, value)?.evaluate(&update_ctx)?;
            updates.push(Nest::Leaf(Item::Value(f(&update_ctx, component, arg)?)));
        }

        update_regroup(updates, true, &self.registry)?
            .into_leaf()
            .ok_or_else(|| ReplicaError::usage("Update results must be single values"))
    }

    fn reduce_to(
        &self,
        ctx: &Context<'_, V>,
        op: ReduceOp,
        value: &Item<V>,
        destinations: &[Device],
    ) -> Result<Item<V>> {
        let reduced = self.reduce_values(ctx, op, value)?;
        self.mirrored_on(reduced, destinations)
    }

    fn broadcast_to(&self, ctx: &Context<'_, V>, value: &Item<V>, destinations: &[Device]) -> Result<Item<V>> {
        let value = value.evaluate(&ctx.enter_or_assert_strategy(self)?)?;
        self.mirrored_on(value, destinations)
    }

    fn reduce(&self, ctx: &Context<'_, V>, op: ReduceOp, value: &Item<V>) -> Result<Output<V>> {
        let reduced = self.reduce_values(ctx, op, value)?;
        Ok(Output::ready(ctx.device().cloned(), reduced))
    }

    fn read_var(&self, ctx: &Context<'_, V>, variable: &DistributedVariable<V>) -> Result<Output<V>> {
        let ctx = ctx.enter_or_assert_strategy(self)?;
        match variable.get_cross_replica(&ctx)? {
            Item::Value(output) => Ok(output),
            other => Ok(Output::ready(ctx.device().cloned(), other.evaluate(&ctx)?)),
        }
    }
}

impl<V: ReplicaValue> fmt::Debug for LocalStrategy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStrategy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("devices", &self.devices)
            .finish()
    }
}

struct RendezvousState<V: ReplicaValue> {
    pending: Vec<Option<Nest<Item<V>>>>,
    arrived: usize,
    generation: u64,
    result: Option<Result<Nest<Item<V>>>>,
    aborted: Option<ReplicaError>,
}

/// Merge point shared by the replica threads of one [`LocalStrategy::run`] call.
struct Rendezvous<V: ReplicaValue> {
    state: Mutex<RendezvousState<V>>,
    changed: Condvar,
}

impl<V: ReplicaValue> Rendezvous<V> {
    fn new(num_replicas: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                pending: (0..num_replicas).map(|_| None).collect(),
                arrived: 0,
                generation: 0,
                result: None,
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn abort(&self, replica: usize, err: &ReplicaError) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            state.aborted = Some(ReplicaError::Aborted {
                replica,
                reason: err.to_string(),
            });
        }
        self.changed.notify_all();
    }
}

impl<V: ReplicaValue> MergeCall<V> for Rendezvous<V> {
    fn merge_call(
        &self,
        ctx: &Context<'_, V>,
        args: Nest<Item<V>>,
        merge_fn: &MergeFn<'_, V>,
    ) -> Result<Nest<Item<V>>> {
        let (Some(id), Some(strategy)) = (ctx.current_replica_id(), ctx.strategy()) else {
            return Err(ReplicaError::usage(
                "merge_call needs a replica id and an active strategy",
            ));
        };

        let mut state = self.state.lock();
        if let Some(err) = &state.aborted {
            return Err(err.clone());
        }
        state.pending[id] = Some(args);
        state.arrived += 1;

        if state.arrived == state.pending.len() {
            let contributions: Option<Vec<_>> = state.pending.iter_mut().map(Option::take).collect();
            state.arrived = 0;
            drop(state);

            log::debug!("Running merge of {} replicas", ctx.num_replicas_in_sync());
            let merge_ctx = Context::scoped(strategy);
            let merge_ctx = match ctx.accelerator() {
                Some(cache) => merge_ctx.in_accelerator(cache),
                None => merge_ctx,
            };
            let merged = contributions
                .ok_or_else(|| ReplicaError::usage("A replica contributed twice to one merge"))
                .and_then(|contributions| regroup(contributions, strategy.registry()))
                .and_then(|grouped| merge_fn(&merge_ctx, grouped));

            state = self.state.lock();
            state.result = Some(merged);
            state.generation += 1;
            self.changed.notify_all();
        } else {
            let generation = state.generation;
            while state.generation == generation {
                if let Some(err) = &state.aborted {
                    return Err(err.clone());
                }
                self.changed.wait(&mut state);
            }
        }

        let merged = state
            .result
            .clone()
            .ok_or_else(|| ReplicaError::usage("Merge finished without a result"))??;
        select_replica(id, &merged)
    }
}

struct AbortOnPanic<'a, V: ReplicaValue> {
    rendezvous: &'a Rendezvous<V>,
    id: usize,
}

impl<V: ReplicaValue> Drop for AbortOnPanic<'_, V> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.rendezvous
                .abort(self.id, &ReplicaError::usage("replica function panicked"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;

    fn strategy(n: usize) -> Arc<LocalStrategy<f32>> {
        LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
    }

    #[test]
    fn test_run_regroups_replica_outputs() {
        let strategy = strategy(3);
        let result = strategy
            .run(|ctx| {
                let id = ctx.current_replica_id().unwrap();
                Ok(Nest::Leaf(Item::value(id as f32, ctx.device().cloned())))
            })
            .unwrap();

        let Some(Item::PerReplica(values)) = result.as_leaf() else {
            panic!("Expected a PerReplica leaf, got {:?}", result);
        };
        let ctx = strategy.scope();
        let read: Vec<f32> = values
            .values()
            .iter()
            .map(|item| item.evaluate(&ctx).unwrap())
            .collect();
        assert_eq!(read, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_merge_call_sums_contributions() {
        let strategy = strategy(4);
        let result = strategy
            .run(|ctx| {
                let contribution = Item::value(1.0, ctx.device().cloned());
                ctx.merge_call(Nest::Leaf(contribution), &|merge_ctx, grouped| {
                    let strategy = merge_ctx.strategy().unwrap();
                    let value = grouped.into_leaf().unwrap();
                    strategy
                        .reduce_to(merge_ctx, ReduceOp::Sum, &value, strategy.devices())
                        .map(Nest::Leaf)
                })
            })
            .unwrap();

        let Some(Item::PerReplica(values)) = result.as_leaf() else {
            panic!("Expected a PerReplica leaf, got {:?}", result);
        };
        let ctx = strategy.scope();
        for item in values.values() {
            assert_eq!(item.evaluate(&ctx).unwrap(), 4.0);
        }
    }

    #[test]
    fn test_failing_replica_releases_waiting_peers() {
        let strategy = strategy(2);
        let result = strategy.run(|ctx| {
            if ctx.current_replica_id() == Some(1) {
                return Err(ReplicaError::usage("replica 1 gave up"));
            }
            ctx.merge_call(Nest::Seq(Vec::new()), &|_, grouped| Ok(grouped))
        });

        assert_eq!(result.unwrap_err(), ReplicaError::usage("replica 1 gave up"));
    }

    #[test]
    fn test_components_keep_their_first_owner() {
        let strategy = strategy(2);
        let first = strategy
            .create_variable(VariableOptions::new().with_name("w"), 1.0)
            .unwrap();
        let shared: Arc<dyn Strategy<f32>> = strategy.clone();
        let components = first.values().to_vec();

        let second = make_distributed_variable(&shared, move |_, _| Ok(components), VariableOptions::new());
        assert_eq!(
            second.unwrap_err(),
            ReplicaError::usage("Component w:0 is already owned by another distributed variable")
        );

        let owner = strategy.registry().container_of(&first.values()[1]).unwrap();
        assert!(owner.ptr_eq(&first));
    }

    #[test]
    fn test_dropped_variable_releases_its_components() {
        let strategy = strategy(2);
        let variable = strategy.create_variable(VariableOptions::new(), 1.0).unwrap();
        let component = variable.values()[0].clone();
        assert!(strategy.registry().contains(&component));

        drop(variable);
        assert!(!strategy.registry().contains(&component));
        assert!(strategy.registry().container_of(&component).is_none());
    }

    #[test]
    #[should_panic = "cannot be reduced with Sum across 2 replicas"]
    fn test_sum_of_non_distributed_value_is_rejected() {
        let strategy = strategy(2);
        let ctx = strategy.scope();
        let _reduced = strategy
            .reduce(&ctx, ReduceOp::Sum, &Item::value(1.0, None))
            .unwrap();
    }
}
