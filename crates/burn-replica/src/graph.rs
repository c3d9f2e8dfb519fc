//! Minimal dataflow handles.
//!
//! Physical updates and reads produce [`Output`]s: values that may already be
//! available, may be computed lazily on first evaluation, or may be completed later
//! by another thread through a [`Promise`]. An [`Op`] is an output without a value.
//! Control dependencies are expressed by listing other nodes as inputs: evaluating
//! a node first evaluates all of its inputs.

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::device::Device;
use crate::error::{ReplicaError, Result};

type Action<T> = Box<dyn FnOnce() -> T + Send>;

/// Something that can be waited on as a control dependency.
pub trait Dependency: Send + Sync {
    /// Blocks until the dependency has completed, running it if it is lazy.
    /// Fails when the dependency was abandoned.
    fn wait(&self) -> Result<()>;
    /// Whether the dependency has completed.
    fn is_ready(&self) -> bool;
}

enum Slot<T> {
    Pending,
    Ready(T),
    Abandoned,
}

struct Node<T> {
    name: Option<String>,
    device: Option<Device>,
    inputs: Vec<Arc<dyn Dependency>>,
    action: Mutex<Option<Action<T>>>,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Node<T> {
    fn complete(&self, state: Slot<T>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = state;
        }
        self.ready.notify_all();
    }

    fn abandoned(&self) -> ReplicaError {
        ReplicaError::Abandoned(format!(
            "{} will never complete",
            self.name.as_deref().unwrap_or("output")
        ))
    }
}

impl<T: Clone + Send + 'static> Node<T> {
    fn try_evaluate(&self) -> Result<T> {
        for input in &self.inputs {
            input.wait()?;
        }

        let action = self.action.lock().take();
        if let Some(action) = action {
            match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(value) => self.complete(Slot::Ready(value)),
                Err(payload) => {
                    self.complete(Slot::Abandoned);
                    panic::resume_unwind(payload);
                }
            }
        }

        let mut slot = self.slot.lock();
        loop {
            match &*slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Abandoned => return Err(self.abandoned()),
                Slot::Pending => self.ready.wait(&mut slot),
            }
        }
    }
}

impl<T: Clone + Send + 'static> Dependency for Node<T> {
    fn wait(&self) -> Result<()> {
        self.try_evaluate().map(|_| ())
    }

    fn is_ready(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Ready(_))
    }
}

/// The result of an operation, placed on an optional device.
///
/// Cloning an output clones the handle, not the value. Two handles are the same
/// output when [`Output::ptr_eq`] holds.
pub struct Output<T> {
    node: Arc<Node<T>>,
}

/// An output that carries no value, only completion.
pub type Op = Output<()>;

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Output<T> {
    fn from_node(
        name: Option<String>,
        device: Option<Device>,
        inputs: Vec<Arc<dyn Dependency>>,
        action: Option<Action<T>>,
        slot: Slot<T>,
    ) -> Self {
        Self {
            node: Arc::new(Node {
                name,
                device,
                inputs,
                action: Mutex::new(action),
                slot: Mutex::new(slot),
                ready: Condvar::new(),
            }),
        }
    }

    /// An output whose value is already known.
    pub fn ready(device: Option<Device>, value: T) -> Self {
        Self::from_node(None, device, Vec::new(), None, Slot::Ready(value))
    }

    /// An output computed by `action` the first time it is evaluated.
    pub fn from_fn<F>(device: Option<Device>, action: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::from_node(None, device, Vec::new(), Some(Box::new(action)), Slot::Pending)
    }

    /// Like [`Output::from_fn`], with a name and control inputs that complete first.
    pub fn named_fn<F>(
        name: Option<&str>,
        device: Option<Device>,
        inputs: Vec<Arc<dyn Dependency>>,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::from_node(
            name.map(Into::into),
            device,
            inputs,
            Some(Box::new(action)),
            Slot::Pending,
        )
    }

    /// An output completed later through the returned [`Promise`].
    pub fn pending(device: Option<Device>) -> (Self, Promise<T>) {
        let output = Self::from_node(None, device, Vec::new(), None, Slot::Pending);
        let promise = Promise {
            node: output.node.clone(),
        };
        (output, promise)
    }

    /// Evaluates the output, blocking until its inputs and itself have completed.
    ///
    /// # Panics
    ///
    /// When the output or one of its inputs was abandoned, see
    /// [`Output::try_evaluate`].
    pub fn evaluate(&self) -> T {
        match self.node.try_evaluate() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Evaluates the output, failing with [`ReplicaError::Abandoned`] instead
    /// of blocking forever when it can never complete.
    pub fn try_evaluate(&self) -> Result<T> {
        self.node.try_evaluate()
    }

    /// Whether the value is available without blocking.
    pub fn is_ready(&self) -> bool {
        Dependency::is_ready(self.node.as_ref())
    }

    /// A new output with the same value that only completes after `control`.
    pub fn identity(&self, device: Option<Device>, control: &[Op]) -> Self {
        let source = self.clone();
        let inputs = control.iter().map(Op::as_dependency).collect();
        Self::named_fn(None, device, inputs, move || source.evaluate())
    }

    /// The output as a type-erased control dependency.
    pub fn as_dependency(&self) -> Arc<dyn Dependency> {
        self.node.clone()
    }
}

impl<T> Output<T> {
    /// The device the value lives on, if placed.
    pub fn device(&self) -> Option<&Device> {
        self.node.device.as_ref()
    }

    /// The name given at construction.
    pub fn name(&self) -> Option<&str> {
        self.node.name.as_deref()
    }

    /// Reference equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.node.name)
            .field("device", &self.node.device)
            .finish_non_exhaustive()
    }
}

impl Op {
    /// An op that has already completed.
    pub fn no_op() -> Self {
        Self::ready(None, ())
    }

    /// Runs the op and everything it depends on.
    pub fn run(&self) {
        self.evaluate()
    }
}

/// Completes a [`Output::pending`] output.
pub struct Promise<T> {
    node: Arc<Node<T>>,
}

impl<T> Promise<T> {
    /// Stores the value and wakes every evaluator.
    pub fn fulfill(self, value: T) {
        self.node.complete(Slot::Ready(value));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.node.complete(Slot::Abandoned);
    }
}

/// An op that completes once every dependency has completed, in no defined order.
pub fn group(dependencies: Vec<Arc<dyn Dependency>>) -> Op {
    group_named(None, dependencies)
}

pub(crate) fn group_named(name: Option<&str>, dependencies: Vec<Arc<dyn Dependency>>) -> Op {
    Op::named_fn(name, None, dependencies, || ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lazy_output_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let output = Output::from_fn(None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            7
        });

        assert!(!output.is_ready());
        assert_eq!(output.evaluate(), 7);
        assert_eq!(output.evaluate(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_group_runs_every_dependency() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ops: Vec<Op> = (0..3)
            .map(|_| {
                let counter = calls.clone();
                Op::from_fn(None, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let grouped = group(ops.iter().map(Op::as_dependency).collect());
        grouped.run();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(ops.iter().all(Op::is_ready));
    }

    #[test]
    fn test_dropped_promise_releases_evaluators() {
        let (gate, promise) = Op::pending(None);
        let read = Output::ready(None, 1.0f32).identity(None, &[gate.clone()]);

        let handle = std::thread::spawn(move || read.try_evaluate());
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(promise);

        assert!(matches!(handle.join().unwrap(), Err(ReplicaError::Abandoned(_))));
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_panicking_action_poisons_the_output() {
        let output = Output::<f32>::from_fn(None, || panic!("backend failure"));
        let first = output.clone();

        assert!(std::thread::spawn(move || first.evaluate()).join().is_err());
        assert_eq!(
            output.try_evaluate(),
            Err(ReplicaError::Abandoned("output will never complete".into()))
        );
    }

    #[test]
    fn test_identity_waits_for_control_inputs() {
        let (gate, promise) = Op::pending(None);
        let value = Output::ready(Some(Device::gpu(0)), 1.5f32);
        let read = value.identity(Some(Device::gpu(0)), &[gate]);

        let handle = std::thread::spawn(move || read.evaluate());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        promise.fulfill(());
        assert_eq!(handle.join().unwrap(), 1.5);
    }
}
