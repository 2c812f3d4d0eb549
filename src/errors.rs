use std::time::Duration;

use aws_sdk_ec2::error::SdkError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all provisioning operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed API (message: {message:?}, retryable: {retryable:?})")]
    API { message: String, retryable: bool },
    #[error("failed for other reasons (message: {message:?}, retryable: {retryable:?})")]
    Other { message: String, retryable: bool },

    /// Not enough free device paths for the requested volumes.
    #[error("not enough local volume targets (requested {requested}, available {available})")]
    InsufficientTargets { requested: usize, available: usize },
    /// The attach call kept failing after every retry.
    #[error("failed to attach volume {volume_id} at {device} after {attempts} attempt(s): {message}")]
    AttachFailure {
        volume_id: String,
        device: String,
        attempts: u32,
        message: String,
    },
    /// The requested volume belongs to another instance.
    #[error("volume {volume_id} is already attached to instance {instance_id}")]
    AlreadyAttachedElsewhere {
        volume_id: String,
        instance_id: String,
    },
    /// A poll loop exceeded its deadline.
    #[error("timed out waiting for '{operation}' on {target} (elapsed {elapsed:?})")]
    Timeout {
        operation: String,
        target: String,
        elapsed: Duration,
    },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::API { message, .. } | Error::Other { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Returns if the error is retryable.
    #[inline]
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Error::API { retryable, .. } | Error::Other { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[inline]
pub fn is_sdk_err_retryable<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- errors::test_retryable --exact --show-output
#[test]
fn test_retryable() {
    let _ = env_logger::builder().is_test(true).try_init();

    let err = Error::API {
        message: "throttled".to_string(),
        retryable: true,
    };
    assert!(err.retryable());
    assert_eq!(err.message(), "throttled");

    let err = Error::InsufficientTargets {
        requested: 4,
        available: 2,
    };
    assert!(!err.retryable());
    assert!(err.message().contains("requested 4, available 2"));

    let err = Error::Timeout {
        operation: "wait_available".to_string(),
        target: "vol-123".to_string(),
        elapsed: Duration::from_secs(3),
    };
    assert!(err.retryable());
    log::info!("{}", err);
}
