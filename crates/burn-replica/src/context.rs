use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::nest::Nest;
use crate::strategy::Strategy;
use crate::value::ReplicaValue;
use crate::values::Item;
use crate::variable::HandleCache;

/// The function run once, in cross-replica context, when every replica reached a
/// merge point. It receives the contributions regrouped into one structure.
pub type MergeFn<'f, V> = dyn Fn(&Context<'_, V>, Nest<Item<V>>) -> Result<Nest<Item<V>>> + Sync + 'f;

/// The rendezvous primitive of a replica context.
///
/// Every replica in sync calls `merge_call` with its own contribution. Execution
/// resumes once the merge function ran on all contributions, and each replica
/// receives its own view of the merged result.
pub trait MergeCall<V: ReplicaValue>: Send + Sync {
    /// Contributes `args` for the calling replica and waits for the merged result.
    fn merge_call(
        &self,
        ctx: &Context<'_, V>,
        args: Nest<Item<V>>,
        merge_fn: &MergeFn<'_, V>,
    ) -> Result<Nest<Item<V>>>;
}

#[derive(Clone)]
struct ReplicaScope<'a, V: ReplicaValue> {
    id: usize,
    num_replicas: usize,
    merge: &'a dyn MergeCall<V>,
}

/// The execution mode a call runs under, passed explicitly down every call.
///
/// A context is either in *cross-replica* mode (code runs once and coordinates all
/// replicas) or in *replica* mode for one replica id. Cross-replica code running an
/// update for one replica carries that replica's id as the update replica id. The
/// context also records which strategy scope is active, the current device, and
/// whether the call is inside an accelerator rewrite.
#[derive(Clone)]
pub struct Context<'a, V: ReplicaValue> {
    strategy: Option<&'a dyn Strategy<V>>,
    replica: Option<ReplicaScope<'a, V>>,
    update_replica: Option<usize>,
    device: Option<Device>,
    accelerator: Option<&'a dyn HandleCache<V>>,
}

impl<V: ReplicaValue> Default for Context<'_, V> {
    fn default() -> Self {
        Self::cross_replica()
    }
}

impl<'a, V: ReplicaValue> Context<'a, V> {
    /// Cross-replica context with no strategy scope entered.
    pub fn cross_replica() -> Self {
        Self {
            strategy: None,
            replica: None,
            update_replica: None,
            device: None,
            accelerator: None,
        }
    }

    /// Cross-replica context inside the scope of `strategy`.
    pub fn scoped(strategy: &'a dyn Strategy<V>) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::cross_replica()
        }
    }

    /// Replica context for replica `id` of `strategy`, merging through `merge`.
    pub fn replica(strategy: &'a dyn Strategy<V>, id: usize, merge: &'a dyn MergeCall<V>) -> Self {
        Self {
            strategy: Some(strategy),
            replica: Some(ReplicaScope {
                id,
                num_replicas: strategy.num_replicas_in_sync(),
                merge,
            }),
            update_replica: None,
            device: strategy.devices().get(id).cloned(),
            accelerator: None,
        }
    }

    /// The same context running an update for one replica.
    pub fn with_update_replica(&self, replica_id: usize) -> Self {
        Self {
            update_replica: Some(replica_id),
            ..self.clone()
        }
    }

    /// The same context placed on `device`.
    pub fn on_device(&self, device: Device) -> Self {
        Self {
            device: Some(device),
            ..self.clone()
        }
    }

    /// The same context inside an accelerator rewrite using `cache` for handles.
    pub fn in_accelerator(&self, cache: &'a dyn HandleCache<V>) -> Self {
        Self {
            accelerator: Some(cache),
            ..self.clone()
        }
    }

    /// The replica id a read or update resolves to: the replica of a replica
    /// context, or the update replica of a cross-replica update.
    pub fn current_replica_id(&self) -> Option<usize> {
        match &self.replica {
            Some(scope) => Some(scope.id),
            None => self.update_replica,
        }
    }

    /// The update replica id, only set in cross-replica context.
    pub fn update_replica_id(&self) -> Option<usize> {
        match self.replica {
            Some(_) => None,
            None => self.update_replica,
        }
    }

    /// Whether code runs once for all replicas.
    pub fn in_cross_replica_context(&self) -> bool {
        self.replica.is_none()
    }

    /// Number of replicas kept in sync, 1 when no strategy is active.
    pub fn num_replicas_in_sync(&self) -> usize {
        match (&self.replica, self.strategy) {
            (Some(scope), _) => scope.num_replicas,
            (None, Some(strategy)) => strategy.num_replicas_in_sync(),
            (None, None) => 1,
        }
    }

    /// The strategy whose scope is active.
    pub fn strategy(&self) -> Option<&'a dyn Strategy<V>> {
        self.strategy
    }

    /// The current device.
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// The enclosing accelerator rewrite, if any.
    pub fn accelerator(&self) -> Option<&'a dyn HandleCache<V>> {
        self.accelerator
    }

    /// Contributes `args` to a merge and returns this replica's view of the result.
    pub fn merge_call(&self, args: Nest<Item<V>>, merge_fn: &MergeFn<'_, V>) -> Result<Nest<Item<V>>> {
        match &self.replica {
            Some(scope) => scope.merge.merge_call(self, args, merge_fn),
            None => Err(ReplicaError::usage(
                "merge_call is only available in a replica context",
            )),
        }
    }

    /// Fails unless the scope of `strategy` is active.
    pub fn assert_strategy(&self, strategy: &dyn Strategy<V>) -> Result<()> {
        let Some(current) = self.strategy else {
            return Err(ReplicaError::usage(format!(
                "Need to be inside the scope of {} for this operation",
                strategy.describe()
            )));
        };
        if current.id() != strategy.id() {
            return Err(ReplicaError::usage(format!(
                "Mixing different strategies: {} is not {}",
                current.describe(),
                strategy.describe()
            )));
        }
        Ok(())
    }

    /// Returns a context inside the scope of `strategy`, entering it when no scope
    /// is active and failing when the scope of another strategy is.
    pub fn enter_or_assert_strategy<'b>(&self, strategy: &'b dyn Strategy<V>) -> Result<Context<'b, V>>
    where
        'a: 'b,
    {
        if self.strategy.is_some() {
            self.assert_strategy(strategy)?;
        }
        Ok(Context {
            strategy: Some(strategy),
            replica: self.replica.clone(),
            update_replica: self.update_replica,
            device: self.device.clone(),
            accelerator: self.accelerator,
        })
    }

    /// Same as [`Context::enter_or_assert_strategy`], naming `variable` when the
    /// scope of another strategy is active.
    pub(crate) fn enter_strategy_of<'b>(
        &self,
        strategy: &'b dyn Strategy<V>,
        variable: &str,
    ) -> Result<Context<'b, V>>
    where
        'a: 'b,
    {
        match self.strategy {
            Some(current) if current.id() != strategy.id() => Err(ReplicaError::usage(format!(
                "Variable {variable} belongs to {} and cannot be used inside the scope of {}",
                strategy.describe(),
                current.describe()
            ))),
            _ => self.enter_or_assert_strategy(strategy),
        }
    }

    /// Fails unless this is a replica context of `strategy`.
    pub(crate) fn assert_replica_context(&self, strategy: &dyn Strategy<V>, what: &str) -> Result<()> {
        let in_strategy = self
            .strategy
            .is_some_and(|current| current.id() == strategy.id());
        if self.replica.is_none() || !in_strategy {
            return Err(ReplicaError::usage(format!(
                "{what} may only be assigned in a replica context of {}",
                strategy.describe()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;
    use crate::strategy::LocalStrategy;

    fn strategy(n: usize) -> std::sync::Arc<LocalStrategy<f32>> {
        LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
    }

    #[test]
    fn test_update_replica_resolves_in_cross_replica() {
        let strategy = strategy(2);
        let ctx = Context::scoped(strategy.as_ref()).with_update_replica(1);

        assert!(ctx.in_cross_replica_context());
        assert_eq!(ctx.current_replica_id(), Some(1));
        assert_eq!(ctx.update_replica_id(), Some(1));
        assert_eq!(ctx.num_replicas_in_sync(), 2);
    }

    #[test]
    fn test_enter_strategy_when_no_scope() {
        let strategy = strategy(2);
        let ctx = Context::<f32>::cross_replica();

        let entered = ctx.enter_or_assert_strategy(strategy.as_ref()).unwrap();
        assert!(entered.assert_strategy(strategy.as_ref()).is_ok());
    }

    #[test]
    #[should_panic = "Mixing different strategies"]
    fn test_mixing_strategies_is_rejected() {
        let first = strategy(2);
        let second = strategy(2);
        let ctx = Context::scoped(first.as_ref());

        let _ctx = ctx.enter_or_assert_strategy(second.as_ref()).unwrap();
    }

    #[test]
    #[should_panic = "Variable weights belongs to LocalStrategy#"]
    fn test_foreign_scope_names_variable() {
        let first = strategy(2);
        let second = strategy(2);
        let ctx = Context::scoped(first.as_ref());

        let _ctx = ctx.enter_strategy_of(second.as_ref(), "weights").unwrap();
    }

    #[test]
    #[should_panic = "merge_call is only available in a replica context"]
    fn test_merge_call_requires_replica_context() {
        let ctx = Context::<f32>::cross_replica();
        let _merged = ctx
            .merge_call(Nest::Seq(Vec::new()), &|_, args| Ok(args))
            .unwrap();
    }
}
