use std::{fmt, path::Path, str::FromStr};

use crate::errors::{Error::Other, Result};
use serde::{Deserialize, Serialize};

/// Root device that only exists on hosts using the legacy "/dev/sd*" naming.
pub const LEGACY_ROOT_DEVICE: &str = "/dev/sda1";

/// Default EBS targets when the host uses "/dev/sd*" names.
pub const DEFAULT_LEGACY_DEVICES: [&str; 9] = [
    "/dev/sdf", "/dev/sdg", "/dev/sdh", "/dev/sdi", "/dev/sdj", "/dev/sdk", "/dev/sdl", "/dev/sdm",
    "/dev/sdn",
];

/// Default EBS targets when the host uses "/dev/xvd*" names.
pub const DEFAULT_PARAVIRTUAL_DEVICES: [&str; 13] = [
    "/dev/xvdf",
    "/dev/xvdg",
    "/dev/xvdh",
    "/dev/xvdj",
    "/dev/xvdk",
    "/dev/xvdl",
    "/dev/xvdm",
    "/dev/xvdn",
    "/dev/xvdba",
    "/dev/xvdbb",
    "/dev/xvdbc",
    "/dev/xvdbd",
    "/dev/xvdbe",
];

/// Block device naming family of the host.
/// The EC2 attach API always takes legacy names, while the kernel may
/// expose the same disk under the paravirtualized prefix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// "/dev/sd*"
    Legacy,
    /// "/dev/xvd*"
    Paravirtual,
}

impl DeviceFamily {
    pub const fn prefix(&self) -> &'static str {
        match self {
            DeviceFamily::Legacy => "/dev/sd",
            DeviceFamily::Paravirtual => "/dev/xvd",
        }
    }

    /// Detects the family once per host by probing the legacy root device.
    pub fn detect(probe: &dyn DeviceProbe) -> Self {
        let family = if probe.exists(Path::new(LEGACY_ROOT_DEVICE)) {
            DeviceFamily::Legacy
        } else {
            DeviceFamily::Paravirtual
        };
        log::info!("detected device naming family {:?}", family);
        family
    }

    pub fn default_devices(&self) -> Vec<DevicePath> {
        let names: &[&str] = match self {
            DeviceFamily::Legacy => &DEFAULT_LEGACY_DEVICES,
            DeviceFamily::Paravirtual => &DEFAULT_PARAVIRTUAL_DEVICES,
        };
        names
            .iter()
            .map(|s| DevicePath {
                family: *self,
                slot: s.trim_start_matches(self.prefix()).to_string(),
            })
            .collect()
    }
}

/// A local block device target such as "/dev/sdf" or "/dev/xvdba".
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DevicePath {
    family: DeviceFamily,
    /// Disk slot letters after the family prefix (e.g., "f", "ba").
    slot: String,
}

impl DevicePath {
    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Returns the same disk slot named under "family".
    #[must_use]
    pub fn to_family(&self, family: DeviceFamily) -> Self {
        Self {
            family,
            slot: self.slot.clone(),
        }
    }

    /// Name expected by the EC2 attach API.
    #[must_use]
    pub fn to_legacy(&self) -> Self {
        self.to_family(DeviceFamily::Legacy)
    }
}

impl FromStr for DevicePath {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        for family in [DeviceFamily::Paravirtual, DeviceFamily::Legacy] {
            if let Some(slot) = s.strip_prefix(family.prefix()) {
                if !slot.is_empty() && slot.chars().all(|c| c.is_ascii_lowercase()) {
                    return Ok(Self {
                        family,
                        slot: slot.to_string(),
                    });
                }
            }
        }
        Err(Other {
            message: format!("invalid device path '{}' (expected /dev/sd* or /dev/xvd*)", s),
            retryable: false,
        })
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.family.prefix(), self.slot)
    }
}

/// Parses a list of device path strings.
pub fn parse_devices<S: AsRef<str>>(names: &[S]) -> Result<Vec<DevicePath>> {
    names.iter().map(|s| s.as_ref().parse()).collect()
}

/// Checks whether a device path is present on the local host.
pub trait DeviceProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn device_exists(&self, device: &DevicePath) -> bool {
        self.exists(Path::new(&device.to_string()))
    }
}

/// Probes the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDevices;

impl DeviceProbe for LocalDevices {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Candidate devices split into occupied and free targets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceTable {
    attached: Vec<DevicePath>,
    /// Free targets in configured order; allocation pops from the end.
    available: Vec<DevicePath>,
}

impl DeviceTable {
    /// Partitions "candidates" by whether each path already exists.
    pub fn partition(candidates: &[DevicePath], probe: &dyn DeviceProbe) -> Self {
        let mut attached = Vec::new();
        let mut available = Vec::new();
        for dev in candidates {
            if probe.device_exists(dev) {
                log::info!("({}) is already an attached EBS volume", dev);
                attached.push(dev.clone());
            } else {
                log::info!("({}) is available as a disk target", dev);
                available.push(dev.clone());
            }
        }
        Self {
            attached,
            available,
        }
    }

    pub fn attached(&self) -> &[DevicePath] {
        &self.attached
    }

    pub fn available(&self) -> &[DevicePath] {
        &self.available
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Takes the next free target, last-configured first.
    pub fn pop_available(&mut self) -> Option<DevicePath> {
        self.available.pop()
    }

    /// Fails unless at least "requested" free targets remain.
    pub fn ensure_available(&self, requested: usize) -> Result<()> {
        if requested > self.available.len() {
            log::error!(
                "do not have enough local volume targets available to attach the drives ({} < {})",
                self.available.len(),
                requested
            );
            return Err(crate::errors::Error::InsufficientTargets {
                requested,
                available: self.available.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::{
        collections::HashSet,
        path::Path,
        sync::{Arc, Mutex},
    };

    use super::DeviceProbe;

    /// In-memory device directory shared with the fake volume API.
    #[derive(Debug, Clone, Default)]
    pub struct FakeDevices {
        present: Arc<Mutex<HashSet<String>>>,
    }

    impl FakeDevices {
        pub fn with(paths: &[&str]) -> Self {
            let d = Self::default();
            for p in paths {
                d.insert(p);
            }
            d
        }

        pub fn insert(&self, path: &str) {
            self.present.lock().unwrap().insert(path.to_string());
        }
    }

    impl DeviceProbe for FakeDevices {
        fn exists(&self, path: &Path) -> bool {
            self.present
                .lock()
                .unwrap()
                .contains(path.to_string_lossy().as_ref())
        }
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::device::test_device_path --exact --show-output
#[test]
fn test_device_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dev: DevicePath = "/dev/xvdba".parse().unwrap();
    assert_eq!(dev.family(), DeviceFamily::Paravirtual);
    assert_eq!(dev.slot(), "ba");
    assert_eq!(dev.to_legacy().to_string(), "/dev/sdba");
    assert_eq!(
        dev.to_legacy().to_family(DeviceFamily::Paravirtual),
        dev
    );

    let dev: DevicePath = "/dev/sdf".parse().unwrap();
    assert_eq!(dev.family(), DeviceFamily::Legacy);
    assert_eq!(dev.to_legacy(), dev);
    assert_eq!(dev.to_family(DeviceFamily::Paravirtual).to_string(), "/dev/xvdf");

    assert!("/dev/nvme1n1".parse::<DevicePath>().is_err());
    assert!("/dev/sd".parse::<DevicePath>().is_err());
    assert!("/dev/sda1".parse::<DevicePath>().is_err());
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::device::test_detect_family --exact --show-output
#[test]
fn test_detect_family() {
    let _ = env_logger::builder().is_test(true).try_init();

    let probe = testutil::FakeDevices::with(&[LEGACY_ROOT_DEVICE]);
    assert_eq!(DeviceFamily::detect(&probe), DeviceFamily::Legacy);
    assert_eq!(DeviceFamily::Legacy.default_devices().len(), 9);

    let probe = testutil::FakeDevices::with(&["/dev/xvda1"]);
    assert_eq!(DeviceFamily::detect(&probe), DeviceFamily::Paravirtual);
    let defaults = DeviceFamily::Paravirtual.default_devices();
    assert_eq!(defaults.len(), 13);
    assert_eq!(defaults[0].to_string(), "/dev/xvdf");
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::device::test_partition --exact --show-output
#[test]
fn test_partition() {
    let _ = env_logger::builder().is_test(true).try_init();

    let candidates = parse_devices(&["/dev/sdf", "/dev/sdg", "/dev/sdh", "/dev/sdi"]).unwrap();
    let probe = testutil::FakeDevices::with(&["/dev/sdg", "/dev/sdi", "/dev/sdz"]);
    let table = DeviceTable::partition(&candidates, &probe);

    let attached: Vec<String> = table.attached().iter().map(|d| d.to_string()).collect();
    let available: Vec<String> = table.available().iter().map(|d| d.to_string()).collect();
    assert_eq!(attached, vec!["/dev/sdg", "/dev/sdi"]);
    assert_eq!(available, vec!["/dev/sdf", "/dev/sdh"]);

    // disjoint, and together they cover every candidate
    for dev in &candidates {
        let in_attached = table.attached().contains(dev);
        let in_available = table.available().contains(dev);
        assert!(in_attached ^ in_available, "{} must be in exactly one set", dev);
    }
    assert_eq!(
        table.attached().len() + table.available_count(),
        candidates.len()
    );
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::device::test_pop_available_lifo --exact --show-output
#[test]
fn test_pop_available_lifo() {
    let candidates = parse_devices(&["/dev/sdf", "/dev/sdg", "/dev/sdh"]).unwrap();
    let mut table = DeviceTable::partition(&candidates, &testutil::FakeDevices::default());

    assert!(table.ensure_available(3).is_ok());
    assert!(matches!(
        table.ensure_available(4),
        Err(crate::errors::Error::InsufficientTargets {
            requested: 4,
            available: 3
        })
    ));

    assert_eq!(table.pop_available().unwrap().to_string(), "/dev/sdh");
    assert_eq!(table.pop_available().unwrap().to_string(), "/dev/sdg");
    assert_eq!(table.pop_available().unwrap().to_string(), "/dev/sdf");
    assert!(table.pop_available().is_none());
}
