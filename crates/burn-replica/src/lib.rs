#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Replicated values and variables for synchronous multi-device training.
//!
//! A computation replicated on several devices produces one value per replica.
//! [`PerReplica`] holds values that may differ, [`Mirrored`] holds values that are
//! kept equal. A [`DistributedVariable`] is a logical variable backed by one
//! component per replica, reconciled either on every write or on read.
//!
//! Everything that depends on *where* code runs (which replica, which strategy
//! scope, which device) is carried by an explicit [`Context`].
//!
//! ```
//! use burn_replica::{Aggregation, DeviceSetBuilder, Item, LocalStrategy, Nest, VariableOptions};
//!
//! let strategy = LocalStrategy::<f32>::new(DeviceSetBuilder::new().with_gpus(2).build().unwrap());
//! let variable = strategy
//!     .create_variable(
//!         VariableOptions::new()
//!             .with_name("weights")
//!             .with_aggregation(Aggregation::Sum),
//!         1.0,
//!     )
//!     .unwrap();
//!
//! // Each replica adds 1; the contributions are summed once and applied everywhere.
//! strategy
//!     .run(|ctx| variable.assign_add(ctx, Item::value(1.0, None)).map(Nest::Leaf))
//!     .unwrap();
//!
//! let total = variable.read_value(&strategy.scope()).unwrap().evaluate();
//! assert_eq!(total, 3.0);
//! ```

mod context;
mod delegate;
mod device;
mod error;
mod graph;
mod nest;
mod regroup;
mod strategy;
mod value;
mod values;
mod variable;

pub mod checkpoint;

pub use context::*;
pub use delegate::*;
pub use device::*;
pub use error::*;
pub use graph::*;
pub use nest::*;
pub use regroup::*;
pub use strategy::*;
pub use value::*;
pub use values::*;
pub use variable::*;
