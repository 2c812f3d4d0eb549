use std::{collections::BTreeMap, sync::Mutex};

use crate::{
    ebs::{Attachment, CreateVolumeRequest, VolumeApi, VolumeInfo, VolumeState},
    ec2::device::{testutil::FakeDevices, DeviceFamily, DevicePath},
    errors::{Error, Result},
};
use async_trait::async_trait;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    Create(CreateVolumeRequest),
    Describe(String),
    Attach {
        volume_id: String,
        instance_id: String,
        device: String,
    },
    Tag {
        resource_id: String,
        tags: Vec<(String, String)>,
    },
}

#[derive(Debug)]
struct FakeVolume {
    state: VolumeState,
    attachment: Option<Attachment>,
    /// Describe calls left before a creating volume turns available.
    pending_describes: u32,
}

#[derive(Debug, Default)]
struct Inner {
    volumes: BTreeMap<String, FakeVolume>,
    next_id: u32,
    calls: Vec<Call>,
    attached: Vec<(String, String, String)>,
    attach_failures: u32,
    stuck_in_creating: bool,
    hide_attached_devices: bool,
}

/// In-memory volume API. Attaching a volume makes its device node appear in
/// the shared "FakeDevices" under the host naming family.
#[derive(Debug)]
pub struct FakeVolumeApi {
    devices: FakeDevices,
    host_family: DeviceFamily,
    inner: Mutex<Inner>,
}

impl FakeVolumeApi {
    pub fn new(devices: FakeDevices, host_family: DeviceFamily) -> Self {
        Self {
            devices,
            host_family,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers an existing volume, optionally attached to "(instance_id, device)".
    pub fn insert_volume(&self, volume_id: &str, attached: Option<(&str, &str)>) {
        let (state, attachment) = match attached {
            Some((instance_id, device)) => (
                VolumeState::InUse,
                Some(Attachment {
                    instance_id: Some(instance_id.to_string()),
                    device: Some(device.to_string()),
                }),
            ),
            None => (VolumeState::Available, None),
        };
        self.inner.lock().unwrap().volumes.insert(
            volume_id.to_string(),
            FakeVolume {
                state,
                attachment,
                pending_describes: 0,
            },
        );
    }

    /// Registers an existing volume still in "creating" that turns available
    /// on the describe call after "describes" more calls.
    pub fn insert_creating_volume(&self, volume_id: &str, describes: u32) {
        self.inner.lock().unwrap().volumes.insert(
            volume_id.to_string(),
            FakeVolume {
                state: VolumeState::Creating,
                attachment: None,
                pending_describes: describes,
            },
        );
    }

    /// Records attachments without the device node ever showing up locally.
    pub fn hide_attached_devices(&self) {
        self.inner.lock().unwrap().hide_attached_devices = true;
    }

    /// Makes the next "n" attach calls fail.
    pub fn fail_attaches(&self, n: u32) {
        self.inner.lock().unwrap().attach_failures = n;
    }

    /// Keeps created volumes in "creating" forever.
    pub fn stick_in_creating(&self) {
        self.inner.lock().unwrap().stuck_in_creating = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn creates(&self) -> Vec<CreateVolumeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn describes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Describe(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Successful attaches as "(volume_id, instance_id, device)".
    pub fn attaches(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().attached.clone()
    }

    /// "Name" tags as "(resource_id, value)".
    pub fn tags(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Tag { resource_id, tags } => tags
                    .into_iter()
                    .find(|(k, _)| k == "Name")
                    .map(|(_, v)| (resource_id, v)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl VolumeApi for FakeVolumeApi {
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Create(req.clone()));
        inner.next_id += 1;
        let volume_id = format!("vol-{}", inner.next_id);
        let pending_describes = if inner.stuck_in_creating { u32::MAX } else { 1 };
        inner.volumes.insert(
            volume_id.clone(),
            FakeVolume {
                state: VolumeState::Creating,
                attachment: None,
                pending_describes,
            },
        );
        Ok(volume_id)
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeInfo> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Describe(volume_id.to_string()));
        let vol = inner.volumes.get_mut(volume_id).ok_or_else(|| Error::API {
            message: format!("volume {} not found", volume_id),
            retryable: false,
        })?;
        if vol.state == VolumeState::Creating {
            if vol.pending_describes == 0 {
                vol.state = VolumeState::Available;
            } else {
                vol.pending_describes -= 1;
            }
        }
        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            state: vol.state.clone(),
            attachment: vol.attachment.clone(),
        })
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Attach {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            device: device.to_string(),
        });
        if inner.attach_failures > 0 {
            inner.attach_failures -= 1;
            return Err(Error::API {
                message: String::from("IncorrectState"),
                retryable: true,
            });
        }
        let vol = inner.volumes.get_mut(volume_id).ok_or_else(|| Error::API {
            message: format!("volume {} not found", volume_id),
            retryable: false,
        })?;
        vol.state = VolumeState::InUse;
        vol.attachment = Some(Attachment {
            instance_id: Some(instance_id.to_string()),
            device: Some(device.to_string()),
        });
        inner.attached.push((
            volume_id.to_string(),
            instance_id.to_string(),
            device.to_string(),
        ));

        if inner.hide_attached_devices {
            return Ok(());
        }
        let local: DevicePath = device.parse()?;
        self.devices
            .insert(&local.to_family(self.host_family).to_string());
        Ok(())
    }

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Tag {
            resource_id: resource_id.to_string(),
            tags: tags.to_vec(),
        });
        Ok(())
    }
}
