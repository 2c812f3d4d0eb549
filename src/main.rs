use std::{io, process};

use clap::{Args, Parser, Subcommand};
use ebs_provisioner::{
    config::Config,
    ebs::{self, Host, VolumeType},
    ec2::{
        self,
        device::{parse_devices, DeviceFamily, LocalDevices},
        metadata,
    },
    errors, load_config,
    output::{self, WriteMode},
};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "ebs-provisioner",
    version,
    about = "Creates or locates EBS volumes and attaches them to this EC2 instance",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonFlags,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates new EBS volumes, attaches and tags them.
    Provision(ProvisionFlags),
    /// Attaches existing EBS volumes by Id and tags them.
    Locate(LocateFlags),
}

#[derive(Debug, Args)]
struct ProvisionFlags {
    /// Number of EBS volumes to create [default: 4]
    #[arg(short = 'c', long = "volcount")]
    volume_count: Option<u32>,

    /// Total size in GB of the EBS volumes to create [default: 512]
    #[arg(short = 'S', long = "volsize")]
    total_size_gb: Option<u32>,

    /// Type of EBS volume: standard, io1, gp2, gp3, sc1 or st1 [default: standard]
    #[arg(short = 't', long = "ebstype", value_parser = parse_volume_type)]
    volume_type: Option<VolumeType>,
}

#[derive(Debug, Args)]
struct LocateFlags {
    /// Comma-separated EBS volume Ids to attach
    #[arg(long = "volume-ids", value_delimiter = ',')]
    volume_ids: Vec<String>,
}

#[derive(Debug, Args)]
struct CommonFlags {
    /// YAML config file; flags override its values
    #[arg(long = "config-file", global = true)]
    config_file: Option<String>,

    /// Comma-separated candidate device paths [default: per host device family]
    #[arg(long = "devices", value_delimiter = ',', global = true)]
    devices: Vec<String>,

    /// File to write the attached device list to [default: /tmp/ebs_vols]
    #[arg(long = "output", global = true)]
    output_path: Option<String>,

    /// Append to the output file instead of overwriting it
    #[arg(long = "append", global = true)]
    append: bool,

    /// Hostname used in the volume "Name" tags [default: local hostname]
    #[arg(long = "hostname", global = true)]
    hostname: Option<String>,

    /// AWS region [default: derived from the availability zone]
    #[arg(long = "region", global = true)]
    region: Option<String>,

    /// Maximum seconds to wait on each volume state transition [default: 300]
    #[arg(long = "poll-timeout-secs", global = true)]
    poll_timeout_secs: Option<u64>,
}

fn parse_volume_type(s: &str) -> Result<VolumeType, String> {
    s.parse::<VolumeType>().map_err(|e| e.message())
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] io::Error),
    #[error("{0}")]
    Provision(#[from] errors::Error),
    #[error("failed to write output: {0}")]
    Output(io::Error),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

/// cargo run -- provision --volcount 2 --volsize 512 --ebstype gp2
/// cargo run -- locate --volume-ids vol-0123,vol-4567
#[tokio::main]
async fn main() {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        process::exit(1);
    }
}

/// Merges the optional config file with the command-line flags.
fn build_config(cli: &Cli) -> Result<Config, CliError> {
    let mut cfg = match &cli.common.config_file {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };

    match &cli.command {
        Command::Provision(flags) => {
            if let Some(v) = flags.volume_count {
                cfg.volume_count = v;
            }
            if let Some(v) = flags.total_size_gb {
                cfg.total_size_gb = v;
            }
            if let Some(v) = flags.volume_type {
                cfg.volume_type = v;
            }
            cfg.validate_provision()?;
        }
        Command::Locate(flags) => {
            if !flags.volume_ids.is_empty() {
                cfg.volume_ids = flags.volume_ids.clone();
            }
            if cfg.volume_ids.is_empty() {
                return Err(CliError::InvalidCommand(String::from(
                    "locate requires at least one volume Id",
                )));
            }
        }
    }

    let common = &cli.common;
    if !common.devices.is_empty() {
        cfg.devices = Some(common.devices.clone());
    }
    if let Some(v) = &common.output_path {
        cfg.output_path = v.clone();
    }
    if common.append {
        cfg.append_output = true;
    }
    if let Some(v) = &common.hostname {
        cfg.hostname = Some(v.clone());
    }
    if let Some(v) = &common.region {
        cfg.region = Some(v.clone());
    }
    if let Some(v) = common.poll_timeout_secs {
        cfg.poll_timeout_ms = v.saturating_mul(1000);
    }

    cfg.validate()?;
    Ok(cfg)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let cfg = build_config(&cli)?;
    log::info!("running with config:\n{}", cfg.encode_yaml()?);

    let probe = LocalDevices;
    let family = DeviceFamily::detect(&probe);
    let candidates = match &cfg.devices {
        Some(names) => parse_devices(names)?,
        None => family.default_devices(),
    };

    let availability_zone = metadata::fetch_availability_zone().await?;
    let instance_id = metadata::fetch_instance_id().await?;
    let region = match &cfg.region {
        Some(r) => r.clone(),
        None => metadata::region_from_availability_zone(&availability_zone)?,
    };
    let hostname = cfg.hostname.clone().unwrap_or_else(whoami::hostname);
    let host = Host {
        instance_id,
        availability_zone,
        hostname,
        family,
    };
    log::info!("running on {:?}", host);

    log::info!("connecting to Amazon...");
    let shared_config = load_config(Some(region)).await;
    let ec2_manager = ec2::Manager::new(&shared_config);
    let manager = ebs::Manager::new(&ec2_manager, &probe, &host, &cfg);

    let devices = match &cli.command {
        Command::Provision(_) => {
            manager
                .provision(
                    &candidates,
                    cfg.volume_count,
                    cfg.total_size_gb,
                    cfg.volume_type,
                )
                .await?
        }
        Command::Locate(_) => manager.locate(&candidates, &cfg.volume_ids).await?,
    };

    output::write_devices(
        &cfg.output_path,
        &devices,
        WriteMode::from_append_flag(cfg.append_output),
    )
    .map_err(CliError::Output)?;
    log::info!("generated EBS vols: {}", output::encode(&devices));

    Ok(())
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --bin ebs-provisioner -- test_build_config --exact --show-output
#[test]
fn test_build_config() {
    let cli = Cli::try_parse_from(["ebs-provisioner", "provision", "-c", "2", "-S", "300", "-t", "io1"])
        .unwrap();
    let cfg = build_config(&cli).unwrap();
    assert_eq!(cfg.volume_count, 2);
    assert_eq!(cfg.total_size_gb, 300);
    assert_eq!(cfg.volume_type, VolumeType::Io1);
    assert_eq!(cfg.output_path, "/tmp/ebs_vols");
    assert!(!cfg.append_output);

    let cli = Cli::try_parse_from([
        "ebs-provisioner",
        "locate",
        "--volume-ids",
        "vol-1,vol-2",
        "--devices",
        "/dev/xvdf,/dev/xvdg",
        "--append",
        "--poll-timeout-secs",
        "60",
    ])
    .unwrap();
    let cfg = build_config(&cli).unwrap();
    assert_eq!(cfg.volume_ids, vec!["vol-1", "vol-2"]);
    assert_eq!(
        cfg.devices,
        Some(vec![String::from("/dev/xvdf"), String::from("/dev/xvdg")])
    );
    assert!(cfg.append_output);
    assert_eq!(cfg.poll_timeout_ms, 60_000);

    let cli = Cli::try_parse_from(["ebs-provisioner", "locate"]).unwrap();
    assert!(matches!(
        build_config(&cli),
        Err(CliError::InvalidCommand(_))
    ));

    assert!(Cli::try_parse_from(["ebs-provisioner", "provision", "-t", "magnetic"]).is_err());

    // sizing errors surface before any metadata or AWS call
    let cli = Cli::try_parse_from(["ebs-provisioner", "provision", "-c", "0"]).unwrap();
    assert!(matches!(build_config(&cli), Err(CliError::Config(_))));
    let cli = Cli::try_parse_from(["ebs-provisioner", "provision", "-S", "2", "-c", "3"]).unwrap();
    assert!(matches!(build_config(&cli), Err(CliError::Config(_))));

    // locate ignores the volume count
    let cli = Cli::try_parse_from(["ebs-provisioner", "locate", "--volume-ids", "vol-1"]).unwrap();
    assert!(build_config(&cli).is_ok());
}
