pub mod compute;
pub mod dns;
pub mod storage;

use aws_config::{BehaviorVersion, Region, SdkConfig};

/// Loads the shared SDK config once; every manager client is constructed
/// from this handle so tests can substitute the whole provider boundary.
pub async fn load_config(region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    loader.load().await
}

/// Region the config resolved to, with the S3 global-endpoint default.
pub fn resolved_region(config: &SdkConfig) -> String {
    config
        .region()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "us-east-1".to_string())
}
