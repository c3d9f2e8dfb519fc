use core::fmt;
use std::collections::BTreeMap;

/// A nested structure of values: sequences, tuples, named records, keyed maps,
/// and leaves.
///
/// Per-replica computations return structures of this shape. Regrouping and
/// selection rebuild the same shape with different leaves.
#[derive(Clone, Debug, PartialEq)]
pub enum Nest<T> {
    /// A single value.
    Leaf(T),
    /// A variable length sequence.
    Seq(Vec<Nest<T>>),
    /// A fixed length tuple.
    Tuple(Vec<Nest<T>>),
    /// A record with a type name and ordered named fields.
    Record {
        /// Name of the record type.
        name: String,
        /// Fields in declaration order.
        fields: Vec<(String, Nest<T>)>,
    },
    /// A mapping with a fixed key set.
    Map(BTreeMap<String, Nest<T>>),
}

impl<T> Nest<T> {
    /// The leaf value, if this is a leaf.
    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Consumes the structure, returning its leaf if it is one.
    pub fn into_leaf(self) -> Option<T> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Rebuilds the structure with `f` applied to every leaf.
    pub fn map<U, F>(self, f: &mut F) -> Nest<U>
    where
        F: FnMut(T) -> U,
    {
        match self.try_map(&mut |leaf| Ok::<_, core::convert::Infallible>(f(leaf))) {
            Ok(nest) => nest,
            Err(never) => match never {},
        }
    }

    /// Rebuilds the structure with the fallible `f` applied to every leaf.
    pub fn try_map<U, E, F>(self, f: &mut F) -> Result<Nest<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(match self {
            Self::Leaf(value) => Nest::Leaf(f(value)?),
            Self::Seq(items) => Nest::Seq(try_map_all(items, f)?),
            Self::Tuple(items) => Nest::Tuple(try_map_all(items, f)?),
            Self::Record { name, fields } => Nest::Record {
                name,
                fields: fields
                    .into_iter()
                    .map(|(key, value)| value.try_map(f).map(|value| (key, value)))
                    .collect::<Result<_, E>>()?,
            },
            Self::Map(entries) => Nest::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| value.try_map(f).map(|value| (key, value)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    /// Like [`Nest::map`], borrowing the leaves.
    pub fn map_ref<U, F>(&self, f: &mut F) -> Nest<U>
    where
        F: FnMut(&T) -> U,
    {
        match self {
            Self::Leaf(value) => Nest::Leaf(f(value)),
            Self::Seq(items) => Nest::Seq(items.iter().map(|item| item.map_ref(f)).collect()),
            Self::Tuple(items) => Nest::Tuple(items.iter().map(|item| item.map_ref(f)).collect()),
            Self::Record { name, fields } => Nest::Record {
                name: name.clone(),
                fields: fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_ref(f)))
                    .collect(),
            },
            Self::Map(entries) => Nest::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_ref(f)))
                    .collect(),
            ),
        }
    }

    /// The leaves in structure order. Map entries are visited in key order.
    pub fn flatten(&self) -> Vec<&T> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(value) => leaves.push(value),
            Self::Seq(items) | Self::Tuple(items) => {
                items.iter().for_each(|item| item.collect_leaves(leaves))
            }
            Self::Record { fields, .. } => fields
                .iter()
                .for_each(|(_, value)| value.collect_leaves(leaves)),
            Self::Map(entries) => entries
                .values()
                .for_each(|value| value.collect_leaves(leaves)),
        }
    }

    /// A description of the structure without its leaves, for diagnostics.
    pub fn shape(&self) -> NestShape<'_, T> {
        NestShape(self)
    }
}

fn try_map_all<T, U, E, F>(items: Vec<Nest<T>>, f: &mut F) -> Result<Vec<Nest<U>>, E>
where
    F: FnMut(T) -> Result<U, E>,
{
    items.into_iter().map(|item| item.try_map(f)).collect()
}

/// Displays the structure of a [`Nest`], writing `*` for every leaf.
pub struct NestShape<'a, T>(&'a Nest<T>);

impl<T> fmt::Display for NestShape<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Nest::Leaf(_) => f.write_str("*"),
            Nest::Seq(items) => write_items(f, "[", items, "]"),
            Nest::Tuple(items) => write_items(f, "(", items, ")"),
            Nest::Record { name, fields } => {
                write!(f, "{name} {{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {}", value.shape())?;
                }
                f.write_str("}")
            }
            Nest::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {}", value.shape())?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_items<T>(f: &mut fmt::Formatter<'_>, open: &str, items: &[Nest<T>], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item.shape())?;
    }
    f.write_str(close)
}

impl<T> From<T> for Nest<T> {
    fn from(value: T) -> Self {
        Self::Leaf(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Nest<i32> {
        Nest::Record {
            name: "Step".into(),
            fields: vec![
                ("loss".into(), Nest::Leaf(1)),
                (
                    "grads".into(),
                    Nest::Map(BTreeMap::from([
                        ("b".into(), Nest::Leaf(3)),
                        ("a".into(), Nest::Tuple(vec![Nest::Leaf(2), Nest::Seq(vec![])])),
                    ])),
                ),
            ],
        }
    }

    #[test]
    fn test_flatten_follows_structure_order() {
        let nest = sample();
        let leaves: Vec<i32> = nest.flatten().into_iter().copied().collect();
        assert_eq!(leaves, vec![1, 2, 3]);
    }

    #[test]
    fn test_map_keeps_shape() {
        let doubled = sample().map(&mut |x| x * 2);
        assert_eq!(doubled.shape().to_string(), sample().shape().to_string());
        let leaves: Vec<i32> = doubled.flatten().into_iter().copied().collect();
        assert_eq!(leaves, vec![2, 4, 6]);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(
            sample().shape().to_string(),
            "Step {loss: *, grads: {\"a\": (*, []), \"b\": *}}"
        );
    }
}
