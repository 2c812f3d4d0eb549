use std::{
    fs::{self, File},
    io::{self, Error, ErrorKind, Write},
    path::Path,
};

use crate::{
    ebs::VolumeType,
    utils::backoff::{PollPolicy, RetryPolicy},
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

pub const DEFAULT_VOLUME_COUNT: u32 = 4;
pub const DEFAULT_TOTAL_SIZE_GB: u32 = 512;
pub const DEFAULT_OUTPUT_PATH: &str = "/tmp/ebs_vols";

/// Run configuration for both provisioning flows.
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Number of new volumes to create.
    pub volume_count: u32,
    /// Total size in GB, split evenly across the new volumes.
    pub total_size_gb: u32,
    pub volume_type: VolumeType,
    /// Existing volume Ids to attach instead of creating new ones.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_ids: Vec<String>,

    /// Candidate device paths; defaults depend on the host device family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,

    /// Hostname used in the volume "Name" tag; defaults to the local hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Region for the EC2 client; defaults to the one of the local availability zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    pub output_path: String,
    /// Appends to "output_path" instead of overwriting it.
    pub append_output: bool,

    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub attach_max_attempts: u32,
    pub attach_backoff_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume_count: DEFAULT_VOLUME_COUNT,
            total_size_gb: DEFAULT_TOTAL_SIZE_GB,
            volume_type: VolumeType::Standard,
            volume_ids: Vec::new(),

            devices: None,

            hostname: None,
            region: None,

            output_path: String::from(DEFAULT_OUTPUT_PATH),
            append_output: false,

            poll_initial_interval_ms: 1000,
            poll_max_interval_ms: 10_000,
            poll_timeout_ms: 300_000,
            attach_max_attempts: 2,
            attach_backoff_ms: 5000,
            settle_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn load(file_path: &str) -> io::Result<Self> {
        log::info!("loading config from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("file {} does not exists", file_path),
            ));
        }

        let f = File::open(file_path).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to open {} ({})", file_path, e),
            )
        })?;
        serde_yaml::from_reader(f)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("invalid YAML: {}", e)))
    }

    /// Saves the current configuration to disk as YAML.
    pub fn sync(&self, file_path: &str) -> io::Result<()> {
        log::info!("syncing config to '{}'", file_path);
        let path = Path::new(file_path);
        if let Some(parent_dir) = path.parent() {
            if !parent_dir.as_os_str().is_empty() {
                fs::create_dir_all(parent_dir)?;
            }
        }

        let d = self.encode_yaml()?;
        let mut f = File::create(file_path)?;
        f.write_all(d.as_bytes())?;

        Ok(())
    }

    pub fn encode_yaml(&self) -> io::Result<String> {
        serde_yaml::to_string(&self).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to serialize Config to YAML {}", e),
            )
        })
    }

    /// Validates the settings shared by both flows.
    pub fn validate(&self) -> io::Result<()> {
        if self.attach_max_attempts == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "attach_max_attempts must be at least 1",
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "poll_timeout_ms must be greater than zero",
            ));
        }
        if self.poll_initial_interval_ms > self.poll_max_interval_ms {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "poll_initial_interval_ms {} exceeds poll_max_interval_ms {}",
                    self.poll_initial_interval_ms, self.poll_max_interval_ms
                ),
            ));
        }
        if self.output_path.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty output_path"));
        }
        Ok(())
    }

    /// Validates the sizing of the provision flow, which the locate flow ignores.
    pub fn validate_provision(&self) -> io::Result<()> {
        if self.volume_count == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "volume_count must be at least 1",
            ));
        }
        if self.total_size_gb / self.volume_count == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "total_size_gb {} is too small for {} volume(s)",
                    self.total_size_gb, self.volume_count
                ),
            ));
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(self.poll_initial_interval_ms),
            max_interval: Duration::from_millis(self.poll_max_interval_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attach_max_attempts,
            backoff: Duration::from_millis(self.attach_backoff_ms),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Millisecond-scale timings for tests.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self {
            poll_initial_interval_ms: 1,
            poll_max_interval_ms: 4,
            poll_timeout_ms: 2000,
            attach_backoff_ms: 1,
            settle_delay_ms: 1,
            ..Self::default()
        }
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- config::test_config --exact --show-output
#[test]
fn test_config() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init();

    let cfg = Config::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.poll_policy().timeout, Duration::from_secs(300));
    assert_eq!(cfg.retry_policy().max_attempts, 2);
    assert_eq!(cfg.retry_policy().backoff, Duration::from_secs(5));

    let d = tempfile::tempdir().unwrap();
    let p = d.path().join("cfg.yaml");
    let p = p.to_str().unwrap();

    let mut cfg = Config::default();
    cfg.volume_type = VolumeType::Io1;
    cfg.devices = Some(vec![String::from("/dev/sdf"), String::from("/dev/sdg")]);
    cfg.sync(p).unwrap();

    let loaded = Config::load(p).unwrap();
    assert_eq!(cfg, loaded);

    let mut bad = Config::default();
    bad.attach_max_attempts = 0;
    assert!(bad.validate().is_err());

    assert!(Config::default().validate_provision().is_ok());
    let no_volumes = Config {
        volume_count: 0,
        ..Default::default()
    };
    assert!(no_volumes.validate().is_ok());
    assert_eq!(
        no_volumes.validate_provision().unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    let too_small = Config {
        volume_count: 3,
        total_size_gb: 2,
        ..Default::default()
    };
    assert!(too_small.validate_provision().is_err());
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- config::test_config_partial_yaml --exact --show-output
#[test]
fn test_config_partial_yaml() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"volume_count: 2\nvolume_type: gp2\nappend_output: true\n")
        .unwrap();
    let p = f.path().to_str().unwrap().to_string();

    let cfg = Config::load(&p).unwrap();
    assert_eq!(cfg.volume_count, 2);
    assert_eq!(cfg.volume_type, VolumeType::Gp2);
    assert!(cfg.append_output);
    // unset keys keep their defaults
    assert_eq!(cfg.total_size_gb, DEFAULT_TOTAL_SIZE_GB);
    assert_eq!(cfg.output_path, DEFAULT_OUTPUT_PATH);

    assert!(Config::load("/nonexistent/ebs-provisioner.yaml").is_err());
}
