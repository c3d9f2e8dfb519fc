use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::device::Device;
use crate::error::{ReplicaError, Result};
use crate::strategy::Strategy;
use crate::value::{Aggregation, ReplicaValue, Synchronization};
use crate::values::DistributedValues;

use super::{ComponentVariable, DistributedVariable, SyncPolicy};

/// How the handle of a distributed variable is resolved.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    /// Per-replica physical handles.
    #[default]
    Host,
    /// Replicated handles from the enclosing accelerator context, when there is one.
    Accelerator,
}

/// Options of a distributed variable.
///
/// ```
/// use burn_replica::{Aggregation, Synchronization, VariableOptions};
///
/// let options = VariableOptions::new()
///     .with_name("accuracy/total")
///     .with_synchronization(Synchronization::OnRead)
///     .with_aggregation(Aggregation::Sum);
/// assert_eq!(options.trainable, None);
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VariableOptions {
    /// Base name of the variable, `Variable` when absent.
    pub name: Option<String>,
    /// How replica-context updates are combined.
    pub aggregation: Aggregation,
    /// When replicas are reconciled.
    pub synchronization: Synchronization,
    /// Whether the variable is trained. Defaults to true, and to false for
    /// sync-on-read variables.
    pub trainable: Option<bool>,
    /// How handles are resolved.
    pub platform: Platform,
}

impl VariableOptions {
    /// Options with every field at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the aggregation.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Sets the synchronization.
    pub fn with_synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }

    /// Sets whether the variable is trained.
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = Some(trainable);
        self
    }

    /// Sets the platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Variable")
    }

    fn resolve(&self) -> Result<(SyncPolicy, bool)> {
        let policy = match self.synchronization {
            Synchronization::None => {
                return Err(ReplicaError::usage(format!(
                    "NONE variable synchronization mode is not supported with a distribution strategy. \
                     Please change the synchronization for variable: {}",
                    self.display_name()
                )));
            }
            Synchronization::Auto | Synchronization::OnWrite => SyncPolicy::OnWrite,
            Synchronization::OnRead => SyncPolicy::OnRead,
        };
        let trainable = match (policy, self.trainable) {
            (SyncPolicy::OnRead, Some(true)) => {
                return Err(ReplicaError::usage(format!(
                    "Synchronization ON_READ can only be set for non-trainable variables, \
                     but {} is trainable",
                    self.display_name()
                )));
            }
            (SyncPolicy::OnRead, _) => false,
            (SyncPolicy::OnWrite, trainable) => trainable.unwrap_or(true),
        };
        Ok((policy, trainable))
    }
}

/// Creates a distributed variable from the components returned by `creator`.
///
/// `creator` receives the strategy's devices and the resolved options, and must
/// return one component per replica, in replica order. The components are
/// registered as owned by the new variable.
pub fn make_distributed_variable<V, F>(
    strategy: &Arc<dyn Strategy<V>>,
    creator: F,
    options: VariableOptions,
) -> Result<DistributedVariable<V>>
where
    V: ReplicaValue,
    F: FnOnce(&[Device], &VariableOptions) -> Result<Vec<ComponentVariable<V>>>,
{
    let (policy, trainable) = options.resolve()?;
    let options = VariableOptions {
        trainable: Some(trainable),
        ..options
    };

    let components = creator(strategy.devices(), &options)?;
    if components.len() != strategy.num_replicas_in_sync() {
        return Err(ReplicaError::usage(format!(
            "Creator of {} returned {} components for {} replicas",
            options.display_name(),
            components.len(),
            strategy.num_replicas_in_sync()
        )));
    }

    let variable = DistributedVariable::from_parts(
        strategy.clone(),
        DistributedValues::new(components)?,
        options.aggregation,
        policy,
        options.platform,
    );
    strategy.registry().register(&variable)?;

    log::debug!(
        "Created {:?} variable {} on {} replicas with aggregation {}",
        policy,
        variable.common_name(),
        variable.values().len(),
        variable.aggregation()
    );
    Ok(variable)
}

/// A creator placing a component holding `initial_value` on every device.
///
/// Replica 0's component is named `name:0`, replica `i`'s `name/replica_i:0`.
pub fn replicated_creator<V: ReplicaValue>(
    initial_value: V,
) -> impl FnOnce(&[Device], &VariableOptions) -> Result<Vec<ComponentVariable<V>>> {
    move |devices, options| {
        let name = options.display_name();
        let trainable = options.trainable.unwrap_or(true);
        Ok(devices
            .iter()
            .enumerate()
            .map(|(i, device)| {
                let component_name = match i {
                    0 => format!("{name}:0"),
                    i => format!("{name}/replica_{i}:0"),
                };
                ComponentVariable::new(component_name, device.clone(), initial_value.clone(), trainable)
            })
            .collect())
    }
}
