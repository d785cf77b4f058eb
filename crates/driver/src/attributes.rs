//! Named status attributes
//!
//! Each device exposes a few small integer attributes, rendered as a decimal
//! followed by a newline. All of them are reachable through the same
//! `show_attribute` / `store_attribute` pair.

use crate::device::TranzportDevice;
use common::{Error, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeMode {
    ReadOnly,
    ReadWrite,
}

pub struct AttributeDescriptor {
    pub name: &'static str,
    pub mode: AttributeMode,
    show: fn(&TranzportDevice) -> bool,
    store: Option<fn(&TranzportDevice, bool)>,
}

impl AttributeDescriptor {
    pub fn show(&self, device: &TranzportDevice) -> String {
        format!("{}\n", u8::from((self.show)(device)))
    }

    /// Parse and apply `input`; returns the number of bytes consumed
    pub fn store(&self, device: &TranzportDevice, input: &str) -> Result<usize> {
        let Some(store) = self.store else {
            return Err(Error::InvalidArgument(format!(
                "attribute '{}' is read-only",
                self.name
            )));
        };

        let value: u64 = input.trim().parse().map_err(|_| {
            Error::InvalidArgument(format!(
                "attribute '{}' expects an unsigned integer, got '{}'",
                self.name,
                input.trim()
            ))
        })?;

        store(device, value != 0);
        Ok(input.len())
    }
}

impl std::fmt::Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

pub static ATTRIBUTES: &[AttributeDescriptor] = &[
    AttributeDescriptor {
        name: "enable",
        mode: AttributeMode::ReadOnly,
        show: TranzportDevice::enable,
        store: None,
    },
    AttributeDescriptor {
        name: "offline",
        mode: AttributeMode::ReadOnly,
        show: TranzportDevice::offline,
        store: None,
    },
    AttributeDescriptor {
        name: "compress_wheel",
        mode: AttributeMode::ReadWrite,
        show: TranzportDevice::compress_wheel,
        store: Some(TranzportDevice::set_compress_wheel),
    },
];

pub fn find_attribute(name: &str) -> Option<&'static AttributeDescriptor> {
    ATTRIBUTES.iter().find(|a| a.name == name)
}

pub fn show_attribute(device: &TranzportDevice, name: &str) -> Result<String> {
    find_attribute(name)
        .map(|attr| attr.show(device))
        .ok_or_else(|| Error::InvalidArgument(format!("no attribute named '{}'", name)))
}

pub fn store_attribute(device: &TranzportDevice, name: &str, value: &str) -> Result<usize> {
    find_attribute(name)
        .ok_or_else(|| Error::InvalidArgument(format!("no attribute named '{}'", name)))?
        .store(device, value)
}

/// Every attribute with its current value
pub fn list_attributes(device: &TranzportDevice) -> Vec<(&'static str, String)> {
    ATTRIBUTES
        .iter()
        .map(|attr| (attr.name, attr.show(device)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::DeviceParams;
    use common::test_utils::MockTransport;

    fn device() -> TranzportDevice {
        let (_mock, binding) = MockTransport::new();
        let config = DriverConfig::default();
        let params = DeviceParams::from_config(0, "mock", &config, &binding.endpoints);
        TranzportDevice::new(params, 8, binding.transport, binding.notifier).unwrap()
    }

    #[test]
    fn test_show_defaults() {
        let dev = device();
        assert_eq!(show_attribute(&dev, "enable").unwrap(), "0\n");
        assert_eq!(show_attribute(&dev, "offline").unwrap(), "0\n");
        assert_eq!(show_attribute(&dev, "compress_wheel").unwrap(), "1\n");
    }

    #[test]
    fn test_store_compress_wheel() {
        let dev = device();
        assert_eq!(store_attribute(&dev, "compress_wheel", "0\n").unwrap(), 2);
        assert!(!dev.compress_wheel());
        store_attribute(&dev, "compress_wheel", " 7 ").unwrap();
        assert!(dev.compress_wheel());
    }

    #[test]
    fn test_store_rejects_bad_input() {
        let dev = device();
        assert!(matches!(
            store_attribute(&dev, "compress_wheel", "yes"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store_attribute(&dev, "compress_wheel", "-1"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store_attribute(&dev, "offline", "1"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            show_attribute(&dev, "missing"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_list() {
        let dev = device();
        let names: Vec<_> = list_attributes(&dev).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["enable", "offline", "compress_wheel"]);
    }
}
