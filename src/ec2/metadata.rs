use crate::errors::{
    Error::{Other, API},
    Result,
};
use reqwest::ClientBuilder;
use tokio::time::Duration;

/// Fetches the instance ID on the host EC2 machine.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-categories.html
pub async fn fetch_instance_id() -> Result<String> {
    fetch_metadata_by_path("instance-id").await
}

/// Fetches the availability zone of the host EC2 machine.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-categories.html
pub async fn fetch_availability_zone() -> Result<String> {
    fetch_metadata_by_path("placement/availability-zone").await
}

/// Strips the trailing zone letter (e.g., "us-west-2a" becomes "us-west-2").
pub fn region_from_availability_zone(az: &str) -> Result<String> {
    let az = az.trim();
    match az.char_indices().last() {
        Some((idx, c)) if idx > 0 && c.is_ascii_alphabetic() => Ok(az[..idx].to_string()),
        _ => Err(Other {
            message: format!("unexpected availability zone '{}'", az),
            retryable: false,
        }),
    }
}

/// Fetches instance metadata service v2 with the "path".
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-retrieval.html
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/configuring-instance-metadata-service.html
/// e.g., curl -H "X-aws-ec2-metadata-token: $TOKEN" -v http://169.254.169.254/latest/meta-data/instance-id
pub async fn fetch_metadata_by_path(path: &str) -> Result<String> {
    log::info!("fetching meta-data/{}", path);

    let token = fetch_token().await?;

    let uri = format!("http://169.254.169.254/latest/meta-data/{}", path);
    let cli = ClientBuilder::new()
        .user_agent(env!("CARGO_PKG_NAME"))
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| API {
            message: format!("failed ClientBuilder build {:?}", e),
            retryable: false,
        })?;
    let resp = cli
        .get(&uri)
        .header("X-aws-ec2-metadata-token", token)
        .send()
        .await
        .map_err(|e| API {
            message: format!("failed GET meta-data/{} {:?}", path, e),
            retryable: e.is_timeout() || e.is_connect(),
        })?;
    let resp = resp.error_for_status().map_err(|e| API {
        message: format!("GET meta-data/{} returned error status {:?}", path, e),
        retryable: false,
    })?;
    resp.text().await.map_err(|e| API {
        message: format!("GET meta-data/{} failed to read body ({})", path, e),
        retryable: false,
    })
}

/// Serves session token for instance metadata service v2.
/// e.g., curl -X PUT "http://169.254.169.254/latest/api/token" -H "X-aws-ec2-metadata-token-ttl-seconds: 21600"
const IMDS_V2_SESSION_TOKEN_URI: &str = "http://169.254.169.254/latest/api/token";

/// Fetches the IMDS v2 token.
async fn fetch_token() -> Result<String> {
    log::info!("fetching IMDS v2 token");

    let cli = ClientBuilder::new()
        .user_agent(env!("CARGO_PKG_NAME"))
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| API {
            message: format!("failed ClientBuilder build {:?}", e),
            retryable: false,
        })?;
    let resp = cli
        .put(IMDS_V2_SESSION_TOKEN_URI)
        .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
        .send()
        .await
        .map_err(|e| API {
            message: format!("failed PUT api/token {:?}", e),
            retryable: e.is_timeout() || e.is_connect(),
        })?;
    resp.text().await.map_err(|e| API {
        message: format!("PUT api/token failed to read body ({})", e),
        retryable: false,
    })
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- ec2::metadata::test_region_from_availability_zone --exact --show-output
#[test]
fn test_region_from_availability_zone() {
    assert_eq!(
        region_from_availability_zone("us-west-2a").unwrap(),
        "us-west-2"
    );
    assert_eq!(
        region_from_availability_zone("ap-northeast-1c\n").unwrap(),
        "ap-northeast-1"
    );
    assert!(region_from_availability_zone("").is_err());
    assert!(region_from_availability_zone("a").is_err());
    assert!(region_from_availability_zone("us-west-2").is_err());
}
