//! Operator forwarding for distributed values.
//!
//! Code written against plain values (loss scaling, metrics) should not need to
//! know it holds a distributed one. A [`Delegate`] resolves to the value of the
//! current replica and forwards operators to it. Since the replica depends on the
//! execution context, every forwarded operator takes the [`Context`] explicitly.

use burn_tensor::{Tensor, backend::Backend};
use core::ops::{Add, BitAnd, BitOr, BitXor, Div, Index, Mul, Neg, Not, Rem, Sub};

use crate::context::Context;
use crate::error::Result;
use crate::value::ReplicaValue;
use crate::values::{Item, Mirrored, PerReplica};
use crate::variable::{AggregatingVariable, DistributedVariable};

/// Exponentiation.
pub trait Pow<Rhs = Self> {
    /// Result type.
    type Output;
    /// `self ** rhs`.
    fn pow(self, rhs: Rhs) -> Self::Output;
}

/// Division rounding toward negative infinity.
pub trait FloorDiv<Rhs = Self> {
    /// Result type.
    type Output;
    /// `self // rhs`.
    fn floor_div(self, rhs: Rhs) -> Self::Output;
}

/// Matrix product.
pub trait MatMul<Rhs = Self> {
    /// Result type.
    type Output;
    /// `self @ rhs`.
    fn matmul(self, rhs: Rhs) -> Self::Output;
}

/// Absolute value.
pub trait Abs {
    /// Result type.
    type Output;
    /// `|self|`.
    fn abs(self) -> Self::Output;
}

macro_rules! float_ops {
    ($($ty:ty),*) => {$(
        impl Pow for $ty {
            type Output = $ty;
            fn pow(self, rhs: $ty) -> $ty {
                self.powf(rhs)
            }
        }

        impl FloorDiv for $ty {
            type Output = $ty;
            fn floor_div(self, rhs: $ty) -> $ty {
                (self / rhs).floor()
            }
        }

        impl Abs for $ty {
            type Output = $ty;
            fn abs(self) -> $ty {
                <$ty>::abs(self)
            }
        }
    )*};
}

macro_rules! int_ops {
    ($($ty:ty),*) => {$(
        impl Pow<u32> for $ty {
            type Output = $ty;
            fn pow(self, rhs: u32) -> $ty {
                <$ty>::pow(self, rhs)
            }
        }

        impl FloorDiv for $ty {
            type Output = $ty;
            fn floor_div(self, rhs: $ty) -> $ty {
                let quotient = self / rhs;
                if self % rhs != 0 && (self < 0) != (rhs < 0) {
                    quotient - 1
                } else {
                    quotient
                }
            }
        }

        impl Abs for $ty {
            type Output = $ty;
            fn abs(self) -> $ty {
                <$ty>::abs(self)
            }
        }
    )*};
}

float_ops!(f32, f64);
int_ops!(i32, i64);

impl<B: Backend, const D: usize> Pow<f32> for Tensor<B, D> {
    type Output = Self;
    fn pow(self, rhs: f32) -> Self {
        self.powf_scalar(rhs)
    }
}

impl<B: Backend, const D: usize> MatMul for Tensor<B, D> {
    type Output = Self;
    fn matmul(self, rhs: Self) -> Self {
        Tensor::matmul(self, rhs)
    }
}

impl<B: Backend, const D: usize> Abs for Tensor<B, D> {
    type Output = Self;
    fn abs(self) -> Self {
        Tensor::abs(self)
    }
}

macro_rules! forward_binary {
    ($($trait:ident :: $method:ident => $name:ident, $rname:ident;)*) => {$(
        #[doc = concat!("`", stringify!($method), "` of the operand and `rhs`.")]
        fn $name<R>(&self, ctx: &Context<'_, V>, rhs: R) -> Result<<V as $trait<R>>::Output>
        where
            V: $trait<R>,
        {
            Ok($trait::$method(self.operand(ctx)?, rhs))
        }

        #[doc = concat!("`", stringify!($method), "` of `lhs` and the operand.")]
        fn $rname<L>(&self, ctx: &Context<'_, V>, lhs: L) -> Result<<L as $trait<V>>::Output>
        where
            L: $trait<V>,
        {
            Ok($trait::$method(lhs, self.operand(ctx)?))
        }
    )*};
}

/// A container usable wherever a single value is expected.
///
/// [`Delegate::select`] resolves the container to the current replica's value.
/// Operators work on [`Delegate::operand`], which defaults to the selected value
/// and is overridden by containers that cannot always select a replica but can
/// still produce an equivalent readable value.
pub trait Delegate<V: ReplicaValue> {
    /// The current replica's value.
    fn select(&self, ctx: &Context<'_, V>) -> Result<Item<V>>;

    /// The value operators are applied to.
    fn operand(&self, ctx: &Context<'_, V>) -> Result<V> {
        self.select(ctx)?.evaluate(ctx)
    }

    forward_binary! {
        Add::add => add, radd;
        Sub::sub => sub, rsub;
        Mul::mul => mul, rmul;
        Div::div => div, rdiv;
        FloorDiv::floor_div => floor_div, rfloor_div;
        Rem::rem => rem, rrem;
        Pow::pow => pow, rpow;
        MatMul::matmul => matmul, rmatmul;
        BitAnd::bitand => bitand, rbitand;
        BitOr::bitor => bitor, rbitor;
        BitXor::bitxor => bitxor, rbitxor;
    }

    /// `-operand`.
    fn neg(&self, ctx: &Context<'_, V>) -> Result<<V as Neg>::Output>
    where
        V: Neg,
    {
        let value = self.operand(ctx)?;
        Ok(-value)
    }

    /// `!operand`.
    fn not(&self, ctx: &Context<'_, V>) -> Result<<V as Not>::Output>
    where
        V: Not,
    {
        let value = self.operand(ctx)?;
        Ok(!value)
    }

    /// `|operand|`.
    fn abs(&self, ctx: &Context<'_, V>) -> Result<<V as Abs>::Output>
    where
        V: Abs,
    {
        let value = self.operand(ctx)?;
        Ok(Abs::abs(value))
    }

    /// `operand < rhs`.
    fn lt<R>(&self, ctx: &Context<'_, V>, rhs: &R) -> Result<bool>
    where
        V: PartialOrd<R>,
    {
        Ok(self.operand(ctx)? < *rhs)
    }

    /// `operand <= rhs`.
    fn le<R>(&self, ctx: &Context<'_, V>, rhs: &R) -> Result<bool>
    where
        V: PartialOrd<R>,
    {
        Ok(self.operand(ctx)? <= *rhs)
    }

    /// `operand > rhs`.
    fn gt<R>(&self, ctx: &Context<'_, V>, rhs: &R) -> Result<bool>
    where
        V: PartialOrd<R>,
    {
        Ok(self.operand(ctx)? > *rhs)
    }

    /// `operand >= rhs`.
    fn ge<R>(&self, ctx: &Context<'_, V>, rhs: &R) -> Result<bool>
    where
        V: PartialOrd<R>,
    {
        Ok(self.operand(ctx)? >= *rhs)
    }

    /// `operand[index]`.
    fn index<I>(&self, ctx: &Context<'_, V>, index: I) -> Result<<V as Index<I>>::Output>
    where
        V: Index<I>,
        <V as Index<I>>::Output: Clone + Sized,
    {
        Ok(self.operand(ctx)?[index].clone())
    }
}

impl<V: ReplicaValue> Delegate<V> for Mirrored<Item<V>> {
    fn select(&self, ctx: &Context<'_, V>) -> Result<Item<V>> {
        self.get(ctx).cloned()
    }
}

impl<V: ReplicaValue> Delegate<V> for PerReplica<Item<V>> {
    fn select(&self, ctx: &Context<'_, V>) -> Result<Item<V>> {
        self.get(ctx).cloned()
    }
}

impl<V: ReplicaValue> Delegate<V> for DistributedVariable<V> {
    fn select(&self, ctx: &Context<'_, V>) -> Result<Item<V>> {
        self.get(ctx)
    }

    fn operand(&self, ctx: &Context<'_, V>) -> Result<V> {
        Ok(self.read_value(ctx)?.evaluate())
    }
}

impl<V: ReplicaValue> Delegate<V> for AggregatingVariable<V> {
    fn select(&self, _ctx: &Context<'_, V>) -> Result<Item<V>> {
        Ok(Item::Component(self.component().clone()))
    }

    fn operand(&self, _ctx: &Context<'_, V>) -> Result<V> {
        self.read_value()
    }
}
