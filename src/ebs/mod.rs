//! EBS volume allocation and attachment for the local EC2 instance.
//!
//! Both flows ("provision" for new volumes, "locate" for existing volume Ids)
//! share the device table bookkeeping and the attach-and-wait helper below.

pub mod locate;
pub mod provision;

#[cfg(test)]
pub(crate) mod fake;

use std::{fmt, str::FromStr};

use crate::{
    config::Config,
    ec2::device::{DeviceFamily, DevicePath, DeviceProbe},
    errors::{Error, Result},
    utils::backoff::{poll_until, retry},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// 30:1 GB:IOPS ratio for provisioned IOPS volumes.
pub const IOPS_PER_GB: u32 = 30;
/// Upper bound on the requested provisioned IOPS.
pub const MAX_IOPS: u32 = 4000;

/// Returns the provisioned IOPS for a volume of "size_gb".
pub fn provisioned_iops(size_gb: u32) -> u32 {
    size_gb.saturating_mul(IOPS_PER_GB).min(MAX_IOPS)
}

/// Splits "total_size_gb" evenly across "count" volumes.
/// Any remainder is dropped (floor), matching the sizes operators expect
/// from previous runs.
pub fn volume_size(total_size_gb: u32, count: u32) -> Result<u32> {
    if count == 0 {
        return Err(Error::Other {
            message: "volume count must be greater than zero".to_string(),
            retryable: false,
        });
    }
    let size = total_size_gb / count;
    if size == 0 {
        return Err(Error::Other {
            message: format!(
                "total size {} GB is too small for {} volumes",
                total_size_gb, count
            ),
            retryable: false,
        });
    }
    let remainder = total_size_gb % count;
    if remainder > 0 {
        log::warn!(
            "{} GB does not divide into {} volumes; dropping {} GB",
            total_size_gb,
            count,
            remainder
        );
    }
    Ok(size)
}

/// EBS volume type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    #[default]
    Standard,
    Io1,
    Gp2,
    Gp3,
    Sc1,
    St1,
}

impl VolumeType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Standard => "standard",
            VolumeType::Io1 => "io1",
            VolumeType::Gp2 => "gp2",
            VolumeType::Gp3 => "gp3",
            VolumeType::Sc1 => "sc1",
            VolumeType::St1 => "st1",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(VolumeType::Standard),
            "io1" => Ok(VolumeType::Io1),
            "gp2" => Ok(VolumeType::Gp2),
            "gp3" => Ok(VolumeType::Gp3),
            "sc1" => Ok(VolumeType::Sc1),
            "st1" => Ok(VolumeType::St1),
            other => Err(Error::Other {
                message: format!("unknown volume type '{}'", other),
                retryable: false,
            }),
        }
    }
}

/// Parameters of a single create-volume call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    pub size_gb: u32,
    pub availability_zone: String,
    pub volume_type: VolumeType,
    /// Only set for "io1".
    pub iops: Option<u32>,
}

/// Lifecycle state reported by the volume API.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    Unknown(String),
}

impl From<&str> for VolumeState {
    fn from(s: &str) -> Self {
        match s {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "in-use" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            other => VolumeState::Unknown(other.to_string()),
        }
    }
}

/// Attachment record of a volume.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Attachment {
    pub instance_id: Option<String>,
    /// Device name as reported by the API (legacy naming).
    pub device: Option<String>,
}

/// Point-in-time view of a volume.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub state: VolumeState,
    pub attachment: Option<Attachment>,
}

impl VolumeInfo {
    pub fn attached_instance_id(&self) -> Option<&str> {
        self.attachment
            .as_ref()
            .and_then(|a| a.instance_id.as_deref())
    }

    pub fn attached_device(&self) -> Option<&str> {
        self.attachment.as_ref().and_then(|a| a.device.as_deref())
    }
}

/// Cloud volume operations used by the provisioning flows.
#[async_trait]
pub trait VolumeApi: Send + Sync {
    /// Requests a new volume and returns its Id.
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<String>;
    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeInfo>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()>;
}

/// Identity of the local instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Host {
    pub instance_id: String,
    pub availability_zone: String,
    pub hostname: String,
    pub family: DeviceFamily,
}

/// Returns the "Name" tag value for a volume attached at "device".
pub fn tag_name(hostname: &str, device: &DevicePath) -> String {
    format!("{}:{}", hostname, device)
}

/// Runs the provisioning flows against a volume API for the local host.
pub struct Manager<'a> {
    api: &'a dyn VolumeApi,
    probe: &'a dyn DeviceProbe,
    host: &'a Host,
    config: &'a Config,
}

impl<'a> Manager<'a> {
    pub fn new(
        api: &'a dyn VolumeApi,
        probe: &'a dyn DeviceProbe,
        host: &'a Host,
        config: &'a Config,
    ) -> Self {
        Self {
            api,
            probe,
            host,
            config,
        }
    }

    /// Polls until the volume reports "available".
    async fn wait_available(&self, volume_id: &str) -> Result<()> {
        let api = self.api;
        poll_until(
            &self.config.poll_policy(),
            "wait_volume_available",
            volume_id,
            move || async move {
                let vol = api.describe_volume(volume_id).await?;
                if vol.state == VolumeState::Available {
                    log::info!("volume {} status is now: available", volume_id);
                    return Ok(Some(()));
                }
                log::info!(
                    "waiting for {} to become available (current {:?})...",
                    volume_id,
                    vol.state
                );
                Ok(None)
            },
        )
        .await
    }

    /// Attaches the volume at "device", then waits until the API shows it
    /// attached to this instance and the device node exists locally.
    async fn attach_and_wait(&self, volume_id: &str, device: &DevicePath) -> Result<()> {
        let api = self.api;
        let probe = self.probe;
        let instance_id = self.host.instance_id.as_str();
        let api_device = device.to_legacy().to_string();
        let api_device = api_device.as_str();

        log::info!(
            "({}) attaching EBS volume to our instance Id ({}) at {} (API device {})",
            volume_id,
            instance_id,
            device,
            api_device
        );
        let policy = self.config.retry_policy();
        retry(&policy, "attach_volume", move || {
            api.attach_volume(volume_id, instance_id, api_device)
        })
        .await
        .map_err(|(attempts, e)| Error::AttachFailure {
            volume_id: volume_id.to_string(),
            device: device.to_string(),
            attempts,
            message: e.message(),
        })?;

        let poll = self.config.poll_policy();
        poll_until(&poll, "wait_attachment_record", volume_id, move || async move {
            let vol = api.describe_volume(volume_id).await?;
            Ok(vol.attached_instance_id().map(|_| ()))
        })
        .await?;

        poll_until(&poll, "wait_attached_locally", volume_id, move || async move {
            let vol = api.describe_volume(volume_id).await?;
            if vol.attached_instance_id() == Some(instance_id) && probe.device_exists(device) {
                return Ok(Some(()));
            }
            log::info!("({}) volume attaching...", volume_id);
            Ok(None)
        })
        .await?;

        // give the OS a moment to settle on the new device
        sleep(self.config.settle_delay()).await;
        log::info!("({}) volume attached at {}", volume_id, device);
        Ok(())
    }

    async fn tag(&self, volume_id: &str, device: &DevicePath) -> Result<()> {
        let tags = vec![(
            String::from("Name"),
            tag_name(&self.host.hostname, device),
        )];
        log::info!("({}) tagging EBS volume with {:?}", volume_id, tags);
        self.api.create_tags(volume_id, &tags).await
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::test_provisioned_iops --exact --show-output
#[test]
fn test_provisioned_iops() {
    assert_eq!(provisioned_iops(1), 30);
    assert_eq!(provisioned_iops(100), 3000);
    assert_eq!(provisioned_iops(133), 3990);
    // cap kicks in right above 133 GB
    assert_eq!(provisioned_iops(134), MAX_IOPS);
    assert_eq!(provisioned_iops(1024), MAX_IOPS);
    assert_eq!(provisioned_iops(u32::MAX), MAX_IOPS);
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::test_volume_size --exact --show-output
#[test]
fn test_volume_size() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(volume_size(512, 2).unwrap(), 256);
    assert_eq!(volume_size(512, 4).unwrap(), 128);
    assert_eq!(volume_size(100, 3).unwrap(), 33);
    assert!(volume_size(512, 0).is_err());
    assert!(volume_size(2, 3).is_err());
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::test_volume_type --exact --show-output
#[test]
fn test_volume_type() {
    assert_eq!("io1".parse::<VolumeType>().unwrap(), VolumeType::Io1);
    assert_eq!("GP2".parse::<VolumeType>().unwrap(), VolumeType::Gp2);
    assert_eq!(VolumeType::default().to_string(), "standard");
    assert!("magnetic".parse::<VolumeType>().is_err());

    assert_eq!(VolumeState::from("in-use"), VolumeState::InUse);
    assert_eq!(
        VolumeState::from("optimizing"),
        VolumeState::Unknown("optimizing".to_string())
    );
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::test_tag_name --exact --show-output
#[test]
fn test_tag_name() {
    let dev: DevicePath = "/dev/xvdf".parse().unwrap();
    assert_eq!(tag_name("db-1", &dev), "db-1:/dev/xvdf");
}
