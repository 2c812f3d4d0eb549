use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use crate::ec2::device::DevicePath;

/// How the device list is written to the output file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteMode {
    /// Replaces any previous content.
    Overwrite,
    /// Extends the list already in the file.
    Append,
}

impl WriteMode {
    pub fn from_append_flag(append: bool) -> Self {
        if append {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        }
    }
}

/// Joins the device paths with commas.
pub fn encode(devices: &[DevicePath]) -> String {
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

/// Writes the comma-joined device list to "file_path".
/// In append mode the file still holds a single comma-joined list.
pub fn write_devices(file_path: &str, devices: &[DevicePath], mode: WriteMode) -> io::Result<()> {
    let line = encode(devices);
    log::info!(
        "writing EBS devices '{}' to '{}' ({:?})",
        line,
        file_path,
        mode
    );

    match mode {
        WriteMode::Overwrite => fs::write(file_path, line.as_bytes()),
        WriteMode::Append => {
            let existing = if Path::new(file_path).exists() {
                fs::read_to_string(file_path)?
            } else {
                String::new()
            };
            let existing = existing.trim_end();

            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(file_path)?;
            if existing.is_empty() {
                f.write_all(line.as_bytes())
            } else if line.is_empty() {
                f.write_all(existing.as_bytes())
            } else {
                f.write_all(format!("{},{}", existing, line).as_bytes())
            }
        }
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- output::test_write_devices --exact --show-output
#[test]
fn test_write_devices() {
    use crate::ec2::device::parse_devices;
    let _ = env_logger::builder().is_test(true).try_init();

    let d = tempfile::tempdir().unwrap();
    let p = d.path().join("ebs_vols");
    let p = p.to_str().unwrap();

    let first = parse_devices(&["/dev/sdg", "/dev/sdf"]).unwrap();
    write_devices(p, &first, WriteMode::Overwrite).unwrap();
    assert_eq!(fs::read_to_string(p).unwrap(), "/dev/sdg,/dev/sdf");

    let second = parse_devices(&["/dev/sdh"]).unwrap();
    write_devices(p, &second, WriteMode::Append).unwrap();
    assert_eq!(fs::read_to_string(p).unwrap(), "/dev/sdg,/dev/sdf,/dev/sdh");

    write_devices(p, &second, WriteMode::Overwrite).unwrap();
    assert_eq!(fs::read_to_string(p).unwrap(), "/dev/sdh");

    // append onto a missing file starts a new list
    let q = d.path().join("fresh");
    let q = q.to_str().unwrap();
    write_devices(q, &first, WriteMode::from_append_flag(true)).unwrap();
    assert_eq!(fs::read_to_string(q).unwrap(), "/dev/sdg,/dev/sdf");

    assert_eq!(encode(&[]), "");
}
