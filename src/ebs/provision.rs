use crate::{
    ebs::{provisioned_iops, volume_size, CreateVolumeRequest, Manager, VolumeType},
    ec2::device::{DevicePath, DeviceTable},
    errors::{Error::Other, Result},
};

impl<'a> Manager<'a> {
    /// Creates "count" volumes splitting "total_size_gb" between them,
    /// attaches each to a free device from "candidates" and tags it.
    /// Returns the attached devices in attach order.
    ///
    /// If any candidate is already attached, those devices are returned as-is
    /// and no volume is created; this tool only handles one volume set per host.
    /// Volumes created before a failure are not rolled back.
    pub async fn provision(
        &self,
        candidates: &[DevicePath],
        count: u32,
        total_size_gb: u32,
        volume_type: VolumeType,
    ) -> Result<Vec<DevicePath>> {
        let size_gb = volume_size(total_size_gb, count)?;

        let mut table = DeviceTable::partition(candidates, self.probe);
        if !table.attached().is_empty() {
            log::warn!(
                "EBS volumes are already attached to this host; passing them back and not touching them"
            );
            return Ok(table.attached().to_vec());
        }
        table.ensure_available(count as usize)?;

        let mut created: Vec<String> = Vec::new();
        let mut attached: Vec<DevicePath> = Vec::new();
        for i in 0..count {
            log::info!(
                "requesting EBS volume creation {}/{} ({} GB, {})",
                i + 1,
                count,
                size_gb,
                volume_type
            );
            let ret = self
                .provision_one(&mut table, size_gb, volume_type, &mut created)
                .await;
            match ret {
                Ok(dev) => attached.push(dev),
                Err(e) => {
                    log::error!(
                        "provisioning failed ({}); volumes created in this run need manual cleanup: {:?}",
                        e,
                        created
                    );
                    return Err(e);
                }
            }
        }

        log::info!("provisioned {} EBS volume(s)", attached.len());
        Ok(attached)
    }

    async fn provision_one(
        &self,
        table: &mut DeviceTable,
        size_gb: u32,
        volume_type: VolumeType,
        created: &mut Vec<String>,
    ) -> Result<DevicePath> {
        let iops = if volume_type == VolumeType::Io1 {
            let iops = provisioned_iops(size_gb);
            log::info!("requesting {} provisioned IOPS...", iops);
            Some(iops)
        } else {
            None
        };

        let req = CreateVolumeRequest {
            size_gb,
            availability_zone: self.host.availability_zone.clone(),
            volume_type,
            iops,
        };
        let volume_id = self.api.create_volume(&req).await?;
        created.push(volume_id.clone());

        self.wait_available(&volume_id).await?;

        // grab a target off of our stack of available devices
        let device = table.pop_available().ok_or_else(|| Other {
            message: format!("no device target left for volume {}", volume_id),
            retryable: false,
        })?;

        self.attach_and_wait(&volume_id, &device).await?;
        self.tag(&volume_id, &device).await?;
        Ok(device)
    }
}
