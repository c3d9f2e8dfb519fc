use burn_tensor::{DType, Element, Tensor, backend::Backend};
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, Result};

/// A value held by one replica: the contents of a physical variable, or the
/// result of a per-replica computation.
///
/// Only the arithmetic the replication protocol itself needs is required here:
/// combining contributions for SUM/MEAN, incremental updates and splitting a
/// total evenly across replicas.
pub trait ReplicaValue: Clone + fmt::Debug + Send + Sync + 'static {
    /// Element type of the value.
    fn dtype(&self) -> DType;

    /// Dimensions of the value, empty for scalars.
    fn shape(&self) -> Vec<usize>;

    /// `self + rhs`.
    fn add_value(&self, rhs: &Self) -> Self;

    /// `self - rhs`.
    fn sub_value(&self, rhs: &Self) -> Self;

    /// `self / count`, cast back to the value's own element type.
    fn div_count(&self, count: usize) -> Self;
}

/// Whether a dtype is a floating point type.
pub fn is_floating(dtype: DType) -> bool {
    matches!(dtype, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
}

macro_rules! scalar_value {
    ($ty:ty, $dtype:expr, |$lhs:ident, $rhs:ident| $add:expr, $sub:expr) => {
        impl ReplicaValue for $ty {
            fn dtype(&self) -> DType {
                $dtype
            }

            fn shape(&self) -> Vec<usize> {
                Vec::new()
            }

            fn add_value(&self, rhs: &Self) -> Self {
                let ($lhs, $rhs) = (*self, *rhs);
                $add
            }

            fn sub_value(&self, rhs: &Self) -> Self {
                let ($lhs, $rhs) = (*self, *rhs);
                $sub
            }

            fn div_count(&self, count: usize) -> Self {
                *self / count as $ty
            }
        }
    };
}

scalar_value!(f32, DType::F32, |a, b| a + b, a - b);
scalar_value!(f64, DType::F64, |a, b| a + b, a - b);
// Integer accumulators wrap on overflow.
scalar_value!(i32, DType::I32, |a, b| a.wrapping_add(b), a.wrapping_sub(b));
scalar_value!(i64, DType::I64, |a, b| a.wrapping_add(b), a.wrapping_sub(b));

impl<B: Backend, const D: usize> ReplicaValue for Tensor<B, D>
where
    Tensor<B, D>: fmt::Debug,
{
    fn dtype(&self) -> DType {
        <B::FloatElem as Element>::dtype()
    }

    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }

    fn add_value(&self, rhs: &Self) -> Self {
        self.clone().add(rhs.clone())
    }

    fn sub_value(&self, rhs: &Self) -> Self {
        self.clone().sub(rhs.clone())
    }

    fn div_count(&self, count: usize) -> Self {
        self.clone().div_scalar(count as f32)
    }
}

/// How per-replica contributions to an update are combined.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    /// No aggregation. Updates in replica context are rejected.
    #[default]
    None,
    /// Sum of all contributions.
    Sum,
    /// Mean of all contributions.
    Mean,
    /// Replica 0's contribution, broadcast to every replica.
    OnlyFirstReplica,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Sum => "SUM",
            Self::Mean => "MEAN",
            Self::OnlyFirstReplica => "ONLY_FIRST_REPLICA",
        };
        f.write_str(name)
    }
}

/// When the replicas of a variable are brought in sync.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Synchronization {
    /// Let the strategy decide, which resolves to [`Synchronization::OnWrite`].
    #[default]
    Auto,
    /// Every write is aggregated and applied to all replicas.
    OnWrite,
    /// Replicas diverge and are reduced when read across replicas.
    OnRead,
    /// Never synchronized. Not supported for distributed variables.
    None,
}

impl fmt::Display for Synchronization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "AUTO",
            Self::OnWrite => "ON_WRITE",
            Self::OnRead => "ON_READ",
            Self::None => "NONE",
        };
        f.write_str(name)
    }
}

/// The different ways to execute the reduce operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ReduceOp {
    /// The sum of the values.
    Sum,
    /// The mean of the values.
    Mean,
}

impl ReduceOp {
    /// The reduction matching an aggregation, if there is one.
    pub fn from_aggregation(aggregation: Aggregation) -> Result<Self> {
        match aggregation {
            Aggregation::Sum => Ok(Self::Sum),
            Aggregation::Mean => Ok(Self::Mean),
            other => Err(ReplicaError::usage(format!(
                "Aggregation {other} has no matching reduce operation"
            ))),
        }
    }

    /// Reduces values contributed by each replica.
    pub fn apply<V: ReplicaValue>(&self, values: &[V]) -> Result<V> {
        let Some((first, rest)) = values.split_first() else {
            return Err(ReplicaError::capability("Cannot reduce an empty set of values"));
        };
        let total = rest.iter().fold(first.clone(), |acc, v| acc.add_value(v));
        Ok(match self {
            Self::Sum => total,
            Self::Mean => total.div_count(values.len()),
        })
    }
}
