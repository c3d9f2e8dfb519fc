//! Structural conversion between per-replica lists of nested values and nested
//! values of per-replica containers.
//!
//! [`regroup`] turns `N` structurally identical per-replica results into one
//! structure whose leaves are containers, and [`select_replica`] extracts one
//! replica's view back out of such a structure. For every replica `i`,
//! `select_replica(i, regroup(values))` reproduces `values[i]`.

use std::sync::Arc;

use crate::error::{ReplicaError, Result};
use crate::graph::{Dependency, group};
use crate::nest::Nest;
use crate::strategy::ContainerRegistry;
use crate::value::ReplicaValue;
use crate::values::{Item, Mirrored, PerReplica};
use crate::variable::SyncPolicy;

/// Wraps the per-replica leaves found at one position into a single item.
pub type Wrap<'f, V> = dyn FnMut(Vec<Item<V>>) -> Result<Item<V>> + 'f;

/// Regroups per-replica structures, wrapping each leaf position in a [`PerReplica`].
pub fn regroup<V: ReplicaValue>(
    values: Vec<Nest<Item<V>>>,
    registry: &ContainerRegistry<V>,
) -> Result<Nest<Item<V>>> {
    regroup_with(values, registry, &mut |items| {
        PerReplica::new(items).map(Item::PerReplica)
    })
}

/// Regroups per-replica structures, wrapping each leaf position with `wrap`.
///
/// Every structure must have the same shape at every level: same kind, same
/// length for sequences and tuples, same record name and fields, same map keys.
///
/// Two leaf positions are not wrapped:
/// - when every replica supplied the very same item, and that item is not a
///   component of a registered variable, the item itself is returned;
/// - when every replica supplied a component of the same distributed variable,
///   that variable is returned.
pub fn regroup_with<V: ReplicaValue>(
    values: Vec<Nest<Item<V>>>,
    registry: &ContainerRegistry<V>,
    wrap: &mut Wrap<'_, V>,
) -> Result<Nest<Item<V>>> {
    if values.is_empty() {
        return Err(ReplicaError::usage("Cannot regroup zero per-replica values"));
    }
    regroup_level(values, registry, wrap)
}

fn regroup_level<V: ReplicaValue>(
    values: Vec<Nest<Item<V>>>,
    registry: &ContainerRegistry<V>,
    wrap: &mut Wrap<'_, V>,
) -> Result<Nest<Item<V>>> {
    let first = &values[0];
    if let Some((replica, other)) = values
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, other)| !same_level(first, other))
    {
        return Err(ReplicaError::mismatch(format!(
            "Replica 0 returned {} but replica {replica} returned {}",
            first.shape(),
            other.shape()
        )));
    }

    let mut level = None;
    let mut rows = Vec::with_capacity(values.len());
    let mut leaves = Vec::with_capacity(values.len());
    for value in values {
        match split(value) {
            Split::Leaf(item) => leaves.push(item),
            Split::Branch(kind, children) => {
                level.get_or_insert(kind);
                rows.push(children);
            }
        }
    }

    match level {
        None => regroup_leaves(leaves, registry, wrap).map(Nest::Leaf),
        Some(level) => {
            let children = transpose(rows)
                .into_iter()
                .map(|column| regroup_level(column, registry, wrap))
                .collect::<Result<Vec<_>>>()?;
            Ok(level.rebuild(children))
        }
    }
}

fn regroup_leaves<V: ReplicaValue>(
    items: Vec<Item<V>>,
    registry: &ContainerRegistry<V>,
    wrap: &mut Wrap<'_, V>,
) -> Result<Item<V>> {
    let first = &items[0];
    let registered = matches!(first, Item::Component(component) if registry.contains(component));

    if !registered && items.iter().all(|item| item.same_as(first)) {
        log::trace!("Every replica returned the same {}, keeping it unwrapped", first.kind());
        return Ok(first.clone());
    }

    if let Item::Component(component) = first {
        if let Some(container) = registry.container_of(component) {
            for item in &items[1..] {
                let owned = match item {
                    Item::Component(other) => registry
                        .container_of(other)
                        .is_some_and(|other| other.ptr_eq(&container)),
                    _ => false,
                };
                if !owned {
                    return Err(ReplicaError::mismatch(format!(
                        "Replica 0 returned a component of {} but another replica returned {:?}",
                        container.name(),
                        item
                    )));
                }
            }
            log::trace!("Replica components regrouped into their variable {}", container.name());
            return Ok(Item::Variable(container));
        }
    }

    wrap(items)
}

fn same_level<T>(a: &Nest<T>, b: &Nest<T>) -> bool {
    match (a, b) {
        (Nest::Leaf(_), Nest::Leaf(_)) => true,
        (Nest::Seq(x), Nest::Seq(y)) | (Nest::Tuple(x), Nest::Tuple(y)) => x.len() == y.len(),
        (
            Nest::Record { name, fields },
            Nest::Record {
                name: other_name,
                fields: other_fields,
            },
        ) => {
            name == other_name
                && fields.len() == other_fields.len()
                && fields
                    .iter()
                    .zip(other_fields)
                    .all(|((key, _), (other, _))| key == other)
        }
        (Nest::Map(x), Nest::Map(y)) => x.len() == y.len() && x.keys().eq(y.keys()),
        _ => false,
    }
}

enum Level {
    Seq,
    Tuple,
    Record { name: String, keys: Vec<String> },
    Map(Vec<String>),
}

enum Split<T> {
    Leaf(T),
    Branch(Level, Vec<Nest<T>>),
}

fn split<T>(nest: Nest<T>) -> Split<T> {
    match nest {
        Nest::Leaf(item) => Split::Leaf(item),
        Nest::Seq(items) => Split::Branch(Level::Seq, items),
        Nest::Tuple(items) => Split::Branch(Level::Tuple, items),
        Nest::Record { name, fields } => {
            let (keys, children) = fields.into_iter().unzip();
            Split::Branch(Level::Record { name, keys }, children)
        }
        Nest::Map(entries) => {
            let (keys, children) = entries.into_iter().unzip();
            Split::Branch(Level::Map(keys), children)
        }
    }
}

impl Level {
    fn rebuild<T>(self, children: Vec<Nest<T>>) -> Nest<T> {
        match self {
            Self::Seq => Nest::Seq(children),
            Self::Tuple => Nest::Tuple(children),
            Self::Record { name, keys } => Nest::Record {
                name,
                fields: keys.into_iter().zip(children).collect(),
            },
            Self::Map(keys) => Nest::Map(keys.into_iter().zip(children).collect()),
        }
    }
}

fn transpose<T>(rows: Vec<Vec<T>>) -> Vec<Vec<T>> {
    let width = rows.first().map_or(0, Vec::len);
    let mut columns: Vec<Vec<T>> = (0..width).map(|_| Vec::with_capacity(rows.len())).collect();
    for row in rows {
        for (column, item) in columns.iter_mut().zip(row) {
            column.push(item);
        }
    }
    columns
}

/// Replica `replica_id`'s view of one item.
///
/// Distributed variables are returned unchanged since they resolve their own
/// replica; other containers yield their value for the replica.
pub fn select_item<V: ReplicaValue>(replica_id: usize, item: &Item<V>) -> Result<Item<V>> {
    match item {
        Item::PerReplica(values) => values.inner().replica(replica_id).cloned(),
        Item::Mirrored(values) => values.inner().replica(replica_id).cloned(),
        other => Ok(other.clone()),
    }
}

/// Replica `replica_id`'s view of a structure built by [`regroup`].
pub fn select_replica<V: ReplicaValue>(replica_id: usize, structured: &Nest<Item<V>>) -> Result<Nest<Item<V>>> {
    structured
        .clone()
        .try_map(&mut |item| select_item(replica_id, &item))
}

/// Like [`select_replica`], failing on any leaf that is not kept in sync across
/// replicas.
pub fn select_replica_mirrored<V: ReplicaValue>(
    replica_id: usize,
    structured: &Nest<Item<V>>,
) -> Result<Nest<Item<V>>> {
    let not_mirrored = |item: &Item<V>| {
        ReplicaError::capability(format!(
            "Expected value to be mirrored across replicas: {item:?} in {}",
            structured.shape()
        ))
    };

    structured.clone().try_map(&mut |item| match &item {
        Item::PerReplica(_) => Err(not_mirrored(&item)),
        Item::Mirrored(values) => values.inner().replica(replica_id).cloned(),
        Item::Variable(variable) => match variable.policy() {
            SyncPolicy::OnWrite => variable
                .inner()
                .replica(replica_id)
                .cloned()
                .map(Item::Component),
            SyncPolicy::OnRead => Err(not_mirrored(&item)),
        },
        _ => Ok(item),
    })
}

/// Reassembles the per-replica results of an update.
///
/// Without `group`, the results are regrouped as [`Mirrored`] and each leaf is
/// unwrapped to a tuple of the per-replica results. With `group`, observing any
/// returned value implies every per-replica update has completed: values are
/// wrapped as identities that depend on a group of all updates, and updates
/// without a value are replaced by that group.
pub fn update_regroup<V: ReplicaValue>(
    updates: Vec<Nest<Item<V>>>,
    group_updates: bool,
    registry: &ContainerRegistry<V>,
) -> Result<Nest<Item<V>>> {
    if !group_updates {
        let regrouped = regroup_with(updates, registry, &mut |items| {
            Mirrored::new(items).map(Item::Mirrored)
        })?;
        return Ok(expand_local_results(regrouped));
    }

    regroup_with(updates, registry, &mut grouped_mirrored)
}

fn expand_local_results<V: ReplicaValue>(nest: Nest<Item<V>>) -> Nest<Item<V>> {
    match split(nest) {
        Split::Leaf(item) => Nest::Tuple(local_results(item)),
        Split::Branch(level, children) => {
            level.rebuild(children.into_iter().map(expand_local_results).collect())
        }
    }
}

fn local_results<V: ReplicaValue>(item: Item<V>) -> Vec<Nest<Item<V>>> {
    match item {
        Item::Mirrored(values) => values.values().iter().cloned().map(Nest::Leaf).collect(),
        Item::PerReplica(values) => values.values().iter().cloned().map(Nest::Leaf).collect(),
        Item::Variable(variable) => variable
            .values()
            .iter()
            .cloned()
            .map(|component| Nest::Leaf(Item::Component(component)))
            .collect(),
        other => vec![Nest::Leaf(other)],
    }
}

fn grouped_mirrored<V: ReplicaValue>(items: Vec<Item<V>>) -> Result<Item<V>> {
    if items.len() == 1 {
        return Mirrored::new(items).map(Item::Mirrored);
    }

    let dependencies: Vec<Arc<dyn Dependency>> = items.iter().filter_map(Item::dependency).collect();
    let barrier = group(dependencies);

    if !items.iter().all(Item::is_tensor_like) {
        return Ok(Item::Op(barrier));
    }

    let with_dependency = items
        .iter()
        .filter_map(Item::as_output)
        .map(|output| Item::Value(output.identity(output.device().cloned(), &[barrier.clone()])))
        .collect();
    Mirrored::new(with_dependency).map(Item::Mirrored)
}

/// The distributed variable owning `item` when it is one of its components,
/// otherwise `item` itself. A component whose variable was dropped is returned
/// unchanged.
pub fn value_container<V: ReplicaValue>(item: &Item<V>, registry: &ContainerRegistry<V>) -> Item<V> {
    match item {
        Item::Component(component) => registry
            .container_of(component)
            .map_or_else(|| item.clone(), Item::Variable),
        other => other.clone(),
    }
}
