//! Save and restore of distributed variables.
//!
//! However many components back a variable, it is persisted as one tensor. Each
//! synchronization policy decides how that tensor is produced on save and fanned
//! back out to the components on restore.

use burn_tensor::DType;
use hashbrown::HashMap;

use crate::context::Context;
use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::graph::{Op, group};
use crate::value::{Aggregation, ReplicaValue};
use crate::variable::{AggregatingVariable, ComponentVariable, DistributedVariable, SyncPolicy};

/// Attribute name of a variable's value in a checkpoint.
pub const VARIABLE_VALUE_KEY: &str = "VARIABLE_VALUE";

/// The checkpoint key of the value saved under `name`.
pub fn checkpoint_key(name: &str) -> String {
    format!("{name}/.ATTRIBUTES/{VARIABLE_VALUE_KEY}")
}

type TensorFn<V> = Box<dyn Fn() -> Result<V> + Send + Sync>;

/// One tensor to persist. The tensor is produced when [`SaveSpec::tensor`] is
/// called, so a spec can be built ahead of the save.
pub struct SaveSpec<V> {
    name: String,
    slice_spec: String,
    dtype: DType,
    device: Option<Device>,
    tensor: TensorFn<V>,
}

impl<V: ReplicaValue> SaveSpec<V> {
    /// A spec for the whole tensor produced by `tensor`.
    pub fn new<F>(name: impl Into<String>, dtype: DType, device: Option<Device>, tensor: F) -> Self
    where
        F: Fn() -> Result<V> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            slice_spec: String::new(),
            dtype,
            device,
            tensor: Box::new(tensor),
        }
    }

    /// Name of the tensor in the checkpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Empty when the spec covers the whole tensor.
    pub fn slice_spec(&self) -> &str {
        &self.slice_spec
    }

    /// Element type of the tensor.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device the tensor is read from.
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Produces the tensor to persist.
    pub fn tensor(&self) -> Result<V> {
        (self.tensor)()
    }
}

/// Save and restore adapter of one checkpointed object.
pub trait Saveable<V: ReplicaValue> {
    /// Name the object is saved under.
    fn name(&self) -> &str;

    /// The tensors to persist, in the order [`Saveable::restore`] expects them.
    fn specs(&self) -> &[SaveSpec<V>];

    /// An op writing the restored tensors back when run.
    fn restore(&self, tensors: Vec<V>) -> Result<Op>;
}

/// Objects that can be checkpointed.
pub trait Checkpointable<V: ReplicaValue> {
    /// The adapter saving the object under `name`, or under its own name.
    fn saveable(&self, name: Option<&str>) -> Box<dyn Saveable<V>>;
}

fn single_tensor<V: ReplicaValue>(name: &str, tensors: Vec<V>) -> Result<V> {
    let count = tensors.len();
    let mut tensors = tensors.into_iter();
    match (tensors.next(), tensors.next()) {
        (Some(tensor), None) => Ok(tensor),
        _ => Err(ReplicaError::usage(format!(
            "Restoring {name} expects exactly one tensor, got {count}"
        ))),
    }
}

fn check_shape<V: ReplicaValue>(name: &str, expected: &[usize], value: &V) -> Result<()> {
    let actual = value.shape();
    if actual != expected {
        return Err(ReplicaError::usage(format!(
            "Cannot restore {name}: checkpoint shape {actual:?} does not match variable shape {expected:?}"
        )));
    }
    Ok(())
}

fn assign_all<V: ReplicaValue>(components: &[ComponentVariable<V>], value: V) -> Op {
    group(
        components
            .iter()
            .map(|component| component.assign_op(value.clone()).as_dependency())
            .collect(),
    )
}

/// Saves the cross-replica value of a distributed variable, read through its
/// strategy.
fn variable_spec<V: ReplicaValue>(name: &str, variable: &DistributedVariable<V>) -> SaveSpec<V> {
    let source = variable.clone();
    SaveSpec::new(
        name,
        variable.dtype(),
        Some(variable.primary().device().clone()),
        move || {
            let strategy = source.strategy();
            let ctx = Context::scoped(strategy.as_ref());
            Ok(strategy.read_var(&ctx, &source)?.evaluate())
        },
    )
}

/// Mirrored variables save any component, they are all equal, and restore by
/// writing every component.
struct MirroredSaveable<V: ReplicaValue> {
    variable: DistributedVariable<V>,
    specs: Vec<SaveSpec<V>>,
}

impl<V: ReplicaValue> Saveable<V> for MirroredSaveable<V> {
    fn name(&self) -> &str {
        self.specs[0].name()
    }

    fn restore(&self, tensors: Vec<V>) -> Result<Op> {
        let value = single_tensor(self.name(), tensors)?;
        check_shape(self.name(), &self.variable.shape(), &value)?;
        Ok(assign_all(self.variable.values(), value))
    }

    fn specs(&self) -> &[SaveSpec<V>] {
        &self.specs
    }
}

/// Sync-on-read variables save the reduced value. Restoring a SUM splits the
/// value evenly, so the restored components reduce to the saved total.
struct SyncOnReadSaveable<V: ReplicaValue> {
    variable: DistributedVariable<V>,
    specs: Vec<SaveSpec<V>>,
}

impl<V: ReplicaValue> Saveable<V> for SyncOnReadSaveable<V> {
    fn name(&self) -> &str {
        self.specs[0].name()
    }

    fn specs(&self) -> &[SaveSpec<V>] {
        &self.specs
    }

    fn restore(&self, tensors: Vec<V>) -> Result<Op> {
        let mut value = single_tensor(self.name(), tensors)?;
        check_shape(self.name(), &self.variable.shape(), &value)?;
        if self.variable.aggregation() == Aggregation::Sum {
            value = value.div_count(self.variable.values().len());
        }
        Ok(assign_all(self.variable.values(), value))
    }
}

struct ComponentSaveable<V: ReplicaValue> {
    component: ComponentVariable<V>,
    specs: Vec<SaveSpec<V>>,
}

impl<V: ReplicaValue> ComponentSaveable<V> {
    fn new(name: &str, component: &ComponentVariable<V>) -> Self {
        let source = component.clone();
        let spec = SaveSpec::new(name, component.dtype(), Some(component.device().clone()), move || {
            source.read()
        });
        Self {
            component: component.clone(),
            specs: vec![spec],
        }
    }
}

impl<V: ReplicaValue> Saveable<V> for ComponentSaveable<V> {
    fn name(&self) -> &str {
        self.specs[0].name()
    }

    fn specs(&self) -> &[SaveSpec<V>] {
        &self.specs
    }

    fn restore(&self, tensors: Vec<V>) -> Result<Op> {
        let value = single_tensor(self.name(), tensors)?;
        check_shape(self.name(), &self.component.shape(), &value)?;
        Ok(self.component.assign_op(value))
    }
}

impl<V: ReplicaValue> Checkpointable<V> for DistributedVariable<V> {
    fn saveable(&self, name: Option<&str>) -> Box<dyn Saveable<V>> {
        let name = name.unwrap_or(self.common_name());
        let specs = vec![variable_spec(name, self)];
        match self.policy() {
            SyncPolicy::OnWrite => Box::new(MirroredSaveable {
                variable: self.clone(),
                specs,
            }),
            SyncPolicy::OnRead => Box::new(SyncOnReadSaveable {
                variable: self.clone(),
                specs,
            }),
        }
    }
}

impl<V: ReplicaValue> Checkpointable<V> for AggregatingVariable<V> {
    fn saveable(&self, name: Option<&str>) -> Box<dyn Saveable<V>> {
        let component = self.component();
        let name = name.unwrap_or_else(|| common_name(component));
        Box::new(ComponentSaveable::new(name, component))
    }
}

impl<V: ReplicaValue> Checkpointable<V> for ComponentVariable<V> {
    fn saveable(&self, name: Option<&str>) -> Box<dyn Saveable<V>> {
        let name = name.unwrap_or_else(|| common_name(self));
        Box::new(ComponentSaveable::new(name, self))
    }
}

fn common_name<V: ReplicaValue>(component: &ComponentVariable<V>) -> &str {
    component.name().split(':').next().unwrap_or_default()
}

/// Produces one checkpoint entry per object, keyed by [`checkpoint_key`].
pub fn save_entries<V: ReplicaValue>(objects: &[&dyn Checkpointable<V>]) -> Result<HashMap<String, V>> {
    let mut entries = HashMap::new();
    for object in objects {
        let saveable = object.saveable(None);
        for spec in saveable.specs() {
            let key = checkpoint_key(spec.name());
            if entries.contains_key(&key) {
                return Err(ReplicaError::usage(format!(
                    "Two checkpointed objects are saved under {key}"
                )));
            }
            entries.insert(key, spec.tensor()?);
        }
    }
    log::debug!("Saved {} checkpoint entries", entries.len());
    Ok(entries)
}

fn restore_saveable<V: ReplicaValue>(saveable: &dyn Saveable<V>, entries: &HashMap<String, V>) -> Result<Op> {
    let tensors = saveable
        .specs()
        .iter()
        .map(|spec| {
            let key = checkpoint_key(spec.name());
            entries
                .get(&key)
                .cloned()
                .ok_or_else(|| ReplicaError::usage(format!("Checkpoint has no entry for {key}")))
        })
        .collect::<Result<Vec<_>>>()?;
    saveable.restore(tensors)
}

/// An op restoring every object from `entries` when run.
pub fn restore_entries<V: ReplicaValue>(
    objects: &[&dyn Checkpointable<V>],
    entries: &HashMap<String, V>,
) -> Result<Op> {
    let ops = objects
        .iter()
        .map(|object| restore_saveable(object.saveable(None).as_ref(), entries))
        .collect::<Result<Vec<_>>>()?;
    Ok(group(ops.iter().map(Op::as_dependency).collect()))
}

/// Makes a freshly created variable initialize from `entries` instead of its
/// initial value. Returns whether `entries` held a value for the variable.
pub fn restore_on_create<V: ReplicaValue>(
    variable: &DistributedVariable<V>,
    entries: &HashMap<String, V>,
) -> Result<bool> {
    let saveable = variable.saveable(None);
    if !entries.contains_key(&checkpoint_key(saveable.name())) {
        return Ok(false);
    }
    let op = restore_saveable(saveable.as_ref(), entries)?;
    log::debug!("Variable {} initializes from checkpoint", variable.common_name());
    variable.set_initializer(op);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetBuilder;
    use crate::strategy::LocalStrategy;
    use crate::value::Synchronization;
    use crate::variable::VariableOptions;
    use std::sync::Arc;

    fn strategy(n: usize) -> Arc<LocalStrategy<f32>> {
        LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
    }

    fn components(variable: &DistributedVariable<f32>) -> Vec<f32> {
        variable.values().iter().map(|c| c.read().unwrap()).collect()
    }

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(checkpoint_key("dense/kernel"), "dense/kernel/.ATTRIBUTES/VARIABLE_VALUE");
    }

    #[test]
    fn test_one_spec_per_variable() {
        let strategy = strategy(3);
        let variable = strategy
            .create_variable(VariableOptions::new().with_name("bias"), 1.5)
            .unwrap();
        let saveable = variable.saveable(None);

        assert_eq!(saveable.name(), "bias");
        assert_eq!(saveable.specs().len(), 1);
        assert_eq!(saveable.specs()[0].slice_spec(), "");
        assert_eq!(saveable.specs()[0].device(), Some(&crate::device::Device::gpu(0)));
        assert_eq!(saveable.specs()[0].tensor().unwrap(), 1.5);
    }

    #[test]
    fn test_mirrored_restore_writes_every_component() {
        let strategy = strategy(2);
        let variable = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();

        variable.saveable(Some("w")).restore(vec![4.0]).unwrap().run();
        assert_eq!(components(&variable), vec![4.0, 4.0]);
    }

    #[test]
    fn test_sync_on_read_sum_round_trip() {
        let strategy = strategy(4);
        let variable = strategy
            .create_variable(
                VariableOptions::new()
                    .with_name("total")
                    .with_synchronization(Synchronization::OnRead)
                    .with_aggregation(Aggregation::Sum),
                2.0,
            )
            .unwrap();

        let entries = save_entries::<f32>(&[&variable]).unwrap();
        assert_eq!(entries[&checkpoint_key("total")], 8.0);

        variable.values()[0].assign(100.0).unwrap();
        restore_entries::<f32>(&[&variable], &entries).unwrap().run();
        assert_eq!(components(&variable), vec![2.0; 4]);
    }

    #[test]
    #[should_panic = "Two checkpointed objects are saved under"]
    fn test_duplicate_names_are_rejected() {
        let strategy = strategy(2);
        let first = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();
        let second = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();

        let _entries = save_entries::<f32>(&[&first, &second]).unwrap();
    }

    #[test]
    #[should_panic = "Checkpoint has no entry for missing/.ATTRIBUTES/VARIABLE_VALUE"]
    fn test_missing_entry() {
        let strategy = strategy(2);
        let variable = strategy
            .create_variable(VariableOptions::new().with_name("missing"), 0.0)
            .unwrap();

        let _op = restore_entries::<f32>(&[&variable], &HashMap::new()).unwrap();
    }

    #[test]
    #[should_panic = "expects exactly one tensor, got 2"]
    fn test_restore_takes_one_tensor() {
        let strategy = strategy(2);
        let variable = strategy.create_variable(VariableOptions::new(), 0.0).unwrap();

        let _op = variable.saveable(None).restore(vec![1.0, 2.0]).unwrap();
    }

    #[test]
    fn test_restore_on_create_overrides_initializer() {
        let strategy = strategy(2);
        let variable = strategy
            .create_variable(VariableOptions::new().with_name("step"), 0.0)
            .unwrap();
        let mut entries = HashMap::new();
        entries.insert(checkpoint_key("step"), 9.0);

        assert!(restore_on_create(&variable, &entries).unwrap());
        variable.initializer().run();
        assert_eq!(components(&variable), vec![9.0, 9.0]);

        let other = strategy
            .create_variable(VariableOptions::new().with_name("other"), 0.0)
            .unwrap();
        assert!(!restore_on_create(&other, &entries).unwrap());
    }

    #[test]
    fn test_aggregating_variable_saves_its_component() {
        let strategy = LocalStrategy::<i64>::new(DeviceSetBuilder::new().with_gpus(2).build().unwrap());
        let component = ComponentVariable::new("iterations:0", crate::device::Device::cpu(0), 3i64, false);
        let variable = AggregatingVariable::new(strategy, component, Aggregation::OnlyFirstReplica);

        let entries = save_entries::<i64>(&[&variable]).unwrap();
        assert_eq!(entries[&checkpoint_key("iterations")], 3);
    }
}
