use std::collections::HashSet;

use crate::{
    ebs::{Manager, VolumeState},
    ec2::device::{DevicePath, DeviceTable},
    errors::{Error, Result},
};

impl<'a> Manager<'a> {
    /// Attaches the existing volumes "volume_ids" to free devices from
    /// "candidates", reusing the device of any volume already attached to
    /// this instance. Returns the devices in "volume_ids" order, named under
    /// the host's device family.
    ///
    /// Fails without touching later volumes as soon as one volume is found
    /// attached to another instance. A repeated volume Id is rejected before
    /// any API call.
    pub async fn locate(
        &self,
        candidates: &[DevicePath],
        volume_ids: &[String],
    ) -> Result<Vec<DevicePath>> {
        let mut seen = HashSet::new();
        if let Some(dup) = volume_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(Error::Other {
                message: format!("volume {} is listed more than once", dup),
                retryable: false,
            });
        }

        let mut table = DeviceTable::partition(candidates, self.probe);
        table.ensure_available(volume_ids.len())?;

        let mut attached: Vec<DevicePath> = Vec::with_capacity(volume_ids.len());
        for volume_id in volume_ids {
            let device = self.locate_one(&mut table, volume_id).await?;
            self.tag(volume_id, &device).await?;
            attached.push(device);
        }

        log::info!("located {} EBS volume(s)", attached.len());
        Ok(attached)
    }

    async fn locate_one(&self, table: &mut DeviceTable, volume_id: &str) -> Result<DevicePath> {
        let vol = self.api.describe_volume(volume_id).await?;

        if let Some(owner) = vol.attached_instance_id() {
            if owner != self.host.instance_id {
                log::error!(
                    "volume {} is attached to another instance {}",
                    volume_id,
                    owner
                );
                return Err(Error::AlreadyAttachedElsewhere {
                    volume_id: volume_id.to_string(),
                    instance_id: owner.to_string(),
                });
            }

            let device = match vol.attached_device() {
                Some(d) => d.parse::<DevicePath>()?,
                None => {
                    return Err(Error::API {
                        message: format!(
                            "volume {} is attached to this instance without a device name",
                            volume_id
                        ),
                        retryable: true,
                    })
                }
            };
            let device = device.to_family(self.host.family);
            log::info!(
                "volume {} is already attached to this instance at {}; reusing it",
                volume_id,
                device
            );
            return Ok(device);
        }

        if vol.state != VolumeState::Available {
            self.wait_available(volume_id).await?;
        }

        let device = table.pop_available().ok_or_else(|| Error::InsufficientTargets {
            requested: 1,
            available: 0,
        })?;
        self.attach_and_wait(volume_id, &device).await?;
        Ok(device.to_family(self.host.family))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        ebs::{fake::Call, fake::FakeVolumeApi, Host, Manager},
        ec2::device::{parse_devices, testutil::FakeDevices, DeviceFamily, DevicePath},
        errors::Error,
    };

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    fn host(family: DeviceFamily) -> Host {
        Host {
            instance_id: String::from("i-local"),
            availability_zone: String::from("us-west-2b"),
            hostname: String::from("cache-7"),
            family,
        }
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn strings(devs: &[DevicePath]) -> Vec<String> {
        devs.iter().map(|d| d.to_string()).collect()
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_attach --exact --show-output
    #[test]
    fn test_locate_attach() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Paravirtual);
        api.insert_volume("vol-a", None);
        api.insert_volume("vol-b", None);
        let host = host(DeviceFamily::Paravirtual);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/xvdf", "/dev/xvdg", "/dev/xvdh"]).unwrap();
        let attached = ab!(manager.locate(&candidates, &ids(&["vol-a", "vol-b"]))).unwrap();
        assert_eq!(strings(&attached), vec!["/dev/xvdh", "/dev/xvdg"]);

        assert_eq!(
            api.attaches(),
            vec![
                (String::from("vol-a"), String::from("i-local"), String::from("/dev/sdh")),
                (String::from("vol-b"), String::from("i-local"), String::from("/dev/sdg")),
            ]
        );
        assert_eq!(
            api.tags(),
            vec![
                (String::from("vol-a"), String::from("cache-7:/dev/xvdh")),
                (String::from("vol-b"), String::from("cache-7:/dev/xvdg")),
            ]
        );
        assert!(api.creates().is_empty());
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_reuse --exact --show-output
    #[test]
    fn test_locate_reuse() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::with(&["/dev/xvdf"]);
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Paravirtual);
        // the API reports legacy names
        api.insert_volume("vol-a", Some(("i-local", "/dev/sdf")));
        api.insert_volume("vol-b", None);
        let host = host(DeviceFamily::Paravirtual);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/xvdf", "/dev/xvdg", "/dev/xvdh"]).unwrap();
        let attached = ab!(manager.locate(&candidates, &ids(&["vol-a", "vol-b"]))).unwrap();
        assert_eq!(strings(&attached), vec!["/dev/xvdf", "/dev/xvdh"]);

        // only vol-b needed an attach call
        let attach_calls: Vec<String> = api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Attach { volume_id, .. } => Some(volume_id),
                _ => None,
            })
            .collect();
        assert_eq!(attach_calls, vec!["vol-b"]);
        assert_eq!(api.tags()[0], (String::from("vol-a"), String::from("cache-7:/dev/xvdf")));
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_attached_elsewhere --exact --show-output
    #[test]
    fn test_locate_attached_elsewhere() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        api.insert_volume("vol-a", Some(("i-other", "/dev/sdf")));
        api.insert_volume("vol-b", None);
        let host = host(DeviceFamily::Legacy);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf", "/dev/sdg"]).unwrap();
        let ret = ab!(manager.locate(&candidates, &ids(&["vol-a", "vol-b"])));
        match ret {
            Err(Error::AlreadyAttachedElsewhere {
                volume_id,
                instance_id,
            }) => {
                assert_eq!(volume_id, "vol-a");
                assert_eq!(instance_id, "i-other");
            }
            other => panic!("unexpected {:?}", other),
        }

        // later ids are never touched
        assert_eq!(api.describes(), vec!["vol-a"]);
        assert!(api.attaches().is_empty());
        assert!(api.tags().is_empty());
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_insufficient_targets --exact --show-output
    #[test]
    fn test_locate_insufficient_targets() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::with(&["/dev/sdf"]);
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        let host = host(DeviceFamily::Legacy);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf", "/dev/sdg"]).unwrap();
        let ret = ab!(manager.locate(&candidates, &ids(&["vol-a", "vol-b"])));
        assert!(matches!(
            ret,
            Err(Error::InsufficientTargets {
                requested: 2,
                available: 1
            })
        ));
        assert!(api.calls().is_empty());
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_duplicate_ids --exact --show-output
    #[test]
    fn test_locate_duplicate_ids() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        api.insert_volume("vol-a", None);
        let host = host(DeviceFamily::Legacy);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf", "/dev/sdg"]).unwrap();
        let ret = ab!(manager.locate(&candidates, &ids(&["vol-a", "vol-a"])));
        match ret {
            Err(Error::Other { message, retryable }) => {
                assert!(message.contains("vol-a"));
                assert!(!retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(api.calls().is_empty());
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_wait_available --exact --show-output
    #[test]
    fn test_locate_wait_available() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        api.insert_creating_volume("vol-a", 2);
        let host = host(DeviceFamily::Legacy);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf"]).unwrap();
        let attached = ab!(manager.locate(&candidates, &ids(&["vol-a"]))).unwrap();
        assert_eq!(strings(&attached), vec!["/dev/sdf"]);

        // the attach call only comes after the volume turned available
        let calls = api.calls();
        let first_attach = calls
            .iter()
            .position(|c| matches!(c, Call::Attach { .. }))
            .unwrap();
        let describes_before = calls[..first_attach]
            .iter()
            .filter(|c| matches!(c, Call::Describe(_)))
            .count();
        assert_eq!(describes_before, 3);
        assert_eq!(api.attaches().len(), 1);
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_attach_timeout --exact --show-output
    #[test]
    fn test_locate_attach_timeout() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        api.insert_volume("vol-a", None);
        api.hide_attached_devices();
        let host = host(DeviceFamily::Legacy);
        let mut config = Config::for_test();
        config.poll_timeout_ms = 30;
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf"]).unwrap();
        let ret = ab!(manager.locate(&candidates, &ids(&["vol-a"])));
        match ret {
            Err(Error::Timeout {
                operation, target, ..
            }) => {
                assert_eq!(operation, "wait_attached_locally");
                assert_eq!(target, "vol-a");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(api.attaches().len(), 1);
        assert!(api.tags().is_empty());
    }

    /// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ebs::locate::tests::test_locate_attach_retry --exact --show-output
    #[test]
    fn test_locate_attach_retry() {
        let _ = env_logger::builder().is_test(true).try_init();

        let devices = FakeDevices::default();
        let api = FakeVolumeApi::new(devices.clone(), DeviceFamily::Legacy);
        api.insert_volume("vol-a", None);
        api.fail_attaches(1);
        let host = host(DeviceFamily::Legacy);
        let config = Config::for_test();
        let manager = Manager::new(&api, &devices, &host, &config);

        let candidates = parse_devices(&["/dev/sdf"]).unwrap();
        let attached = ab!(manager.locate(&candidates, &ids(&["vol-a"]))).unwrap();
        assert_eq!(strings(&attached), vec!["/dev/sdf"]);
        assert_eq!(api.attaches().len(), 1);
    }
}
