pub mod device;
pub mod metadata;

use crate::{
    ebs::{Attachment, CreateVolumeRequest, VolumeApi, VolumeInfo, VolumeState},
    errors::{
        self,
        Error::{Other, API},
        Result,
    },
};
use async_trait::async_trait;
use aws_sdk_ec2::{
    types::{Tag, Volume, VolumeType as Ec2VolumeType},
    Client,
};
use aws_types::SdkConfig as AwsSdkConfig;

/// Implements AWS EC2 manager for EBS volumes.
#[derive(Debug, Clone)]
pub struct Manager {
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        Self {
            cli: Client::new(shared_config),
        }
    }

    /// Creates an EBS volume and returns its Id.
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_CreateVolume.html
    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<String> {
        let size = i32::try_from(req.size_gb).map_err(|e| Other {
            message: format!("volume size {} out of range ({})", req.size_gb, e),
            retryable: false,
        })?;
        let iops = match req.iops {
            Some(v) => Some(i32::try_from(v).map_err(|e| Other {
                message: format!("iops {} out of range ({})", v, e),
                retryable: false,
            })?),
            None => None,
        };

        log::info!(
            "creating EBS volume in '{}' ({} GB, {}, iops {:?})",
            req.availability_zone,
            req.size_gb,
            req.volume_type,
            req.iops
        );
        let resp = self
            .cli
            .create_volume()
            .availability_zone(req.availability_zone.clone())
            .size(size)
            .volume_type(Ec2VolumeType::from(req.volume_type.as_str()))
            .set_iops(iops)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed create_volume {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        match resp.volume_id() {
            Some(v) => {
                log::info!("created EBS volume {}", v);
                Ok(v.to_string())
            }
            None => Err(API {
                message: String::from("no volume Id found in create_volume response"),
                retryable: false,
            }),
        }
    }

    /// Describes a single EBS volume by its Id.
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_DescribeVolumes.html
    pub async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
        let resp = self
            .cli
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed describe_volumes {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;

        let volumes = resp.volumes().unwrap_or_default();
        if volumes.len() != 1 {
            return Err(API {
                message: format!(
                    "expected 1 volume for '{}' from describe_volumes but got {}",
                    volume_id,
                    volumes.len()
                ),
                retryable: false,
            });
        }
        Ok(volumes[0].clone())
    }

    /// Attaches the volume to the instance at "device" (legacy naming).
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_AttachVolume.html
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        log::info!(
            "attaching volume '{}' to '{}' at '{}'",
            volume_id,
            instance_id,
            device
        );
        let resp = self
            .cli
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed attach_volume {:?}", e),
                retryable: errors::is_sdk_err_retryable(&e),
            })?;
        log::info!("attach_volume state {:?}", resp.state());
        Ok(())
    }

    /// Adds or overwrites tags on the resource.
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_CreateTags.html
    pub async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()> {
        let mut req = self.cli.create_tags().resources(resource_id);
        for (k, v) in tags {
            req = req.tags(Tag::builder().key(k).value(v).build());
        }
        req.send().await.map_err(|e| API {
            message: format!("failed create_tags {:?}", e),
            retryable: errors::is_sdk_err_retryable(&e),
        })?;
        Ok(())
    }
}

/// Converts the SDK volume into the view used by the provisioning flows.
pub fn volume_info(vol: &Volume) -> VolumeInfo {
    let volume_id = vol.volume_id().unwrap_or_default().to_string();
    let state = vol
        .state()
        .map(|s| VolumeState::from(s.as_str()))
        .unwrap_or_else(|| VolumeState::Unknown(String::from("unknown")));
    let attachment = vol
        .attachments()
        .and_then(|atts| atts.first())
        .map(|a| Attachment {
            instance_id: a.instance_id().map(String::from),
            device: a.device().map(String::from),
        });
    VolumeInfo {
        volume_id,
        state,
        attachment,
    }
}

#[async_trait]
impl VolumeApi for Manager {
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<String> {
        Manager::create_volume(self, req).await
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeInfo> {
        let vol = Manager::describe_volume(self, volume_id).await?;
        Ok(volume_info(&vol))
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        Manager::attach_volume(self, volume_id, instance_id, device).await
    }

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()> {
        Manager::create_tags(self, resource_id, tags).await
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::test_volume_info --exact --show-output
#[test]
fn test_volume_info() {
    use aws_sdk_ec2::types::{VolumeAttachment, VolumeState as Ec2VolumeState};

    let vol = Volume::builder()
        .volume_id("vol-123")
        .state(Ec2VolumeState::InUse)
        .attachments(
            VolumeAttachment::builder()
                .instance_id("i-abc")
                .device("/dev/sdf")
                .build(),
        )
        .build();
    let info = volume_info(&vol);
    assert_eq!(info.volume_id, "vol-123");
    assert_eq!(info.state, VolumeState::InUse);
    assert_eq!(info.attached_instance_id(), Some("i-abc"));
    assert_eq!(info.attached_device(), Some("/dev/sdf"));

    let vol = Volume::builder()
        .volume_id("vol-456")
        .state(Ec2VolumeState::Creating)
        .build();
    let info = volume_info(&vol);
    assert_eq!(info.state, VolumeState::Creating);
    assert!(info.attachment.is_none());
    assert_eq!(info.attached_instance_id(), None);
}
