use core::fmt;
use hashbrown::HashSet;
use std::sync::Arc;

/// A canonical device location, e.g. `/device:GPU:0`.
///
/// Devices are compared by their canonical name, so `gpu:0`, `/device:gpu:0` and
/// `/job:worker/task:0/device:GPU:0` all name the same device.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Device {
    name: Arc<str>,
}

impl Device {
    /// Parses and canonicalizes a device name.
    pub fn parse(name: &str) -> Result<Self, DeviceSetError> {
        let spec = name
            .rsplit_once("device:")
            .map(|(_, spec)| spec)
            .unwrap_or(name)
            .trim_start_matches('/');

        let Some((kind, index)) = spec.split_once(':') else {
            return Err(DeviceSetError::InvalidDevice(format!(
                "Expected `KIND:INDEX`, got {name:?}"
            )));
        };
        if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DeviceSetError::InvalidDevice(format!(
                "Invalid device kind in {name:?}"
            )));
        }
        let index: usize = index.parse().map_err(|_| {
            DeviceSetError::InvalidDevice(format!("Invalid device index in {name:?}"))
        })?;

        Ok(Self::from_parts(kind, index))
    }

    /// Host device with the given index.
    pub fn cpu(index: usize) -> Self {
        Self::from_parts("CPU", index)
    }

    /// Accelerator device with the given index.
    pub fn gpu(index: usize) -> Self {
        Self::from_parts("GPU", index)
    }

    fn from_parts(kind: &str, index: usize) -> Self {
        let name = format!("/device:{}:{}", kind.to_ascii_uppercase(), index);
        Self { name: name.into() }
    }

    /// The canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The ordered set of devices a strategy keeps one replica on.
///
/// Index `i` of the set is the device of replica `i`. The order is fixed once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Number of replicas, one per device.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always false for a built set.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The devices in replica order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The device of a replica.
    pub fn get(&self, replica_id: usize) -> Option<&Device> {
        self.devices.get(replica_id)
    }
}

/// Represents errors that can occur when constructing a `DeviceSet`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceSetError {
    /// A device name could not be parsed.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),
    /// The set as a whole is invalid.
    #[error("Invalid device set: {0}")]
    InvalidSet(String),
}

/// A builder for constructing a [`DeviceSet`].
#[derive(Clone, Debug, Default)]
pub struct DeviceSetBuilder {
    names: Vec<String>,
}

impl DeviceSetBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the device of the next replica.
    pub fn with_device<S: Into<String>>(mut self, name: S) -> Self {
        self.names.push(name.into());
        self
    }

    /// Appends `count` accelerator devices `GPU:0..count`.
    pub fn with_gpus(mut self, count: usize) -> Self {
        self.names
            .extend((0..count).map(|i| Device::gpu(i).name().into()));
        self
    }

    /// Builds a [`DeviceSet`] from the current configuration.
    ///
    /// Every name must parse, and no device may appear twice after canonicalization.
    pub fn build(self) -> Result<DeviceSet, DeviceSetError> {
        if self.names.is_empty() {
            return Err(DeviceSetError::InvalidSet(
                "At least one device is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let device = Device::parse(name)?;
            if !seen.insert(device.clone()) {
                return Err(DeviceSetError::InvalidSet(format!(
                    "Device {} listed more than once",
                    device
                )));
            }
            devices.push(device);
        }

        Ok(DeviceSet { devices })
    }
}
