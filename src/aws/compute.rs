//! EC2 instance manager.
//!
//! Listing asks the provider to filter server-side on the ownership marker
//! tag; every state-mutating path re-fetches the instance and proves
//! ownership before the provider call is issued. Guard checks (capacity
//! ceiling, instance-type allowlist, state-machine preconditions) run first
//! and are terminal on failure.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ec2::types::{
    AttributeValue, Filter, InstanceStateName, InstanceType, ResourceType, Tag, TagSpecification,
};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

use crate::guard::GuardPolicy;
use crate::manager::{OpError, OpResult, ProviderError};
use crate::tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown,
}

impl From<InstanceStateName> for InstanceState {
    fn from(name: InstanceStateName) -> Self {
        match name {
            InstanceStateName::Pending => InstanceState::Pending,
            InstanceStateName::Running => InstanceState::Running,
            InstanceStateName::Stopping => InstanceState::Stopping,
            InstanceStateName::Stopped => InstanceState::Stopped,
            InstanceStateName::ShuttingDown => InstanceState::ShuttingDown,
            InstanceStateName::Terminated => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }
}

/// OS label offered by the front-ends, resolved to a concrete AMI at
/// create time via SSM public parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum OsImage {
    AmazonLinux,
    Ubuntu,
}

impl OsImage {
    pub fn ssm_parameter(&self) -> &'static str {
        match self {
            OsImage::AmazonLinux => {
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
            }
            OsImage::Ubuntu => {
                "/aws/service/canonical/ubuntu/server/22.04/stable/current/amd64/hvm/ebs-gp2/ami-id"
            }
        }
    }

    /// us-east-1 image ids used when the SSM lookup fails; the create call
    /// proceeds on these rather than failing.
    pub fn fallback_ami(&self) -> &'static str {
        match self {
            OsImage::AmazonLinux => "ami-04b70fa74e45c3917",
            OsImage::Ubuntu => "ami-0c7217cdde317cfec",
        }
    }
}

/// Flat instance record normalized from the provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: Option<String>,
    pub state: InstanceState,
    pub instance_type: String,
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub os: OsImage,
    pub instance_type: String,
}

/// Provider boundary for compute. One implementation wraps the real EC2 and
/// SSM clients; tests substitute a recording fake.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Server-side marker-tag-filtered listing.
    async fn list_owned(&self) -> Result<Vec<Instance>, ProviderError>;
    async fn describe(&self, id: &str) -> Result<Option<Instance>, ProviderError>;
    async fn resolve_image(&self, os: OsImage) -> Result<String, ProviderError>;
    async fn run_instance(
        &self,
        image_id: &str,
        instance_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError>;
    async fn start(&self, id: &str) -> Result<(), ProviderError>;
    async fn stop(&self, id: &str) -> Result<(), ProviderError>;
    async fn terminate(&self, id: &str) -> Result<(), ProviderError>;
    async fn modify_instance_type(&self, id: &str, instance_type: &str)
        -> Result<(), ProviderError>;
}

pub struct Ec2Compute {
    ec2: aws_sdk_ec2::Client,
    ssm: aws_sdk_ssm::Client,
}

impl Ec2Compute {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            ec2: aws_sdk_ec2::Client::new(config),
            ssm: aws_sdk_ssm::Client::new(config),
        }
    }
}

fn normalize(instance: aws_sdk_ec2::types::Instance) -> Instance {
    // Tags become a keyed map once per fetch; every later check is a lookup.
    let tags: HashMap<String, String> = instance
        .tags
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| Some((t.key?, t.value?)))
        .collect();
    Instance {
        id: instance.instance_id.unwrap_or_default(),
        name: tags.get("Name").cloned(),
        state: instance
            .state
            .and_then(|s| s.name)
            .map(InstanceState::from)
            .unwrap_or(InstanceState::Unknown),
        instance_type: instance
            .instance_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        public_ip: instance.public_ip_address,
        tags,
    }
}

#[async_trait]
impl ComputeApi for Ec2Compute {
    async fn list_owned(&self) -> Result<Vec<Instance>, ProviderError> {
        let response = self
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", tags::MARKER_KEY))
                    .values(tags::MARKER_VALUE)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        let mut instances = vec![];
        for reservation in response.reservations.unwrap_or_default() {
            for instance in reservation.instances.unwrap_or_default() {
                instances.push(normalize(instance));
            }
        }
        Ok(instances)
    }

    async fn describe(&self, id: &str) -> Result<Option<Instance>, ProviderError> {
        let response = self
            .ec2
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        Ok(response
            .reservations
            .unwrap_or_default()
            .into_iter()
            .flat_map(|r| r.instances.unwrap_or_default())
            .next()
            .map(normalize))
    }

    async fn resolve_image(&self, os: OsImage) -> Result<String, ProviderError> {
        let response = self
            .ssm
            .get_parameter()
            .name(os.ssm_parameter())
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        response
            .parameter
            .and_then(|p| p.value)
            .ok_or_else(|| ProviderError::Api("SSM parameter had no value".to_string()))
    }

    async fn run_instance(
        &self,
        image_id: &str,
        instance_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        let mut spec = TagSpecification::builder().resource_type(ResourceType::Instance);
        for (key, value) in tags {
            spec = spec.tags(Tag::builder().key(key).value(value).build());
        }
        let response = self
            .ec2
            .run_instances()
            .image_id(image_id)
            .instance_type(InstanceType::from(instance_type))
            .min_count(1)
            .max_count(1)
            .tag_specifications(spec.build())
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        response
            .instances
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|i| i.instance_id)
            .ok_or_else(|| ProviderError::Api("run_instances returned no instance".to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2
            .start_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }

    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2
            .stop_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }

    async fn terminate(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }

    async fn modify_instance_type(
        &self,
        id: &str,
        instance_type: &str,
    ) -> Result<(), ProviderError> {
        self.ec2
            .modify_instance_attribute()
            .instance_id(id)
            .instance_type(AttributeValue::builder().value(instance_type).build())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }
}

pub struct ComputeManager<A: ComputeApi> {
    api: A,
    policy: GuardPolicy,
}

impl ComputeManager<Ec2Compute> {
    pub fn new(config: &SdkConfig) -> Self {
        Self::with_api(Ec2Compute::new(config))
    }
}

impl<A: ComputeApi> ComputeManager<A> {
    pub fn with_api(api: A) -> Self {
        Self {
            api,
            policy: GuardPolicy::default(),
        }
    }

    pub async fn list(&self) -> OpResult<Vec<Instance>> {
        let mut instances = self.api.list_owned().await?;
        instances.retain(|i| tags::is_owned(&i.tags));
        Ok(instances)
    }

    /// Guard checks first (fresh capacity count, allowlist), then AMI
    /// resolution with a hardcoded fallback, then the provider create.
    pub async fn create(&self, spec: &LaunchSpec) -> OpResult<String> {
        let owned = self.list().await?;
        let active = owned
            .iter()
            .filter(|i| i.state != InstanceState::Terminated)
            .count();
        self.policy.check_capacity(active)?;
        self.policy.check_instance_type(&spec.instance_type)?;

        let image_id = match self.api.resolve_image(spec.os).await {
            Ok(id) => id,
            Err(e) => {
                warn!(os = %spec.os, error = %e, "AMI lookup failed, using fallback image");
                spec.os.fallback_ami().to_string()
            }
        };

        let mut launch_tags = tags::standard_tags();
        launch_tags.insert("Name".to_string(), spec.name.clone());
        let id = self
            .api
            .run_instance(&image_id, &spec.instance_type, &launch_tags)
            .await?;
        info!(%id, instance_type = %spec.instance_type, "launched instance");
        Ok(id)
    }

    pub async fn start(&self, id: &str) -> OpResult<()> {
        let instance = self.fetch_owned(id).await?;
        require_state(&instance, &[InstanceState::Stopped], "started")?;
        self.api.start(id).await?;
        info!(%id, "start signal sent");
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> OpResult<()> {
        let instance = self.fetch_owned(id).await?;
        require_state(&instance, &[InstanceState::Running], "stopped")?;
        self.api.stop(id).await?;
        info!(%id, "stop signal sent");
        Ok(())
    }

    /// Terminal and irreversible; only running or stopped instances qualify.
    pub async fn terminate(&self, id: &str) -> OpResult<()> {
        let instance = self.fetch_owned(id).await?;
        require_state(
            &instance,
            &[InstanceState::Running, InstanceState::Stopped],
            "terminated",
        )?;
        self.api.terminate(id).await?;
        info!(%id, "terminate signal sent");
        Ok(())
    }

    /// Resize keeps the instance stopped; the allowlist applies here too.
    pub async fn resize(&self, id: &str, instance_type: &str) -> OpResult<()> {
        let instance = self.fetch_owned(id).await?;
        require_state(&instance, &[InstanceState::Stopped], "resized")?;
        self.policy.check_instance_type(instance_type)?;
        self.api.modify_instance_type(id, instance_type).await?;
        info!(%id, %instance_type, "instance resized");
        Ok(())
    }

    /// Re-fetches and proves ownership. Any fetch failure, missing instance
    /// or marker mismatch collapses to `AccessDenied`.
    async fn fetch_owned(&self, id: &str) -> OpResult<Instance> {
        match self.api.describe(id).await {
            Ok(Some(instance)) if tags::is_owned(&instance.tags) => Ok(instance),
            Ok(_) => Err(OpError::AccessDenied),
            Err(_) => Err(OpError::AccessDenied),
        }
    }
}

fn require_state(
    instance: &Instance,
    allowed: &[InstanceState],
    action: &str,
) -> Result<(), OpError> {
    if allowed.contains(&instance.state) {
        return Ok(());
    }
    Err(crate::guard::GuardError::Precondition(format!(
        "instance {} is {} and cannot be {}",
        instance.id, instance.state, action
    ))
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCompute {
        instances: Mutex<Vec<Instance>>,
        image: Option<String>,
        run_calls: AtomicUsize,
        start_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        terminate_calls: AtomicUsize,
        modify_calls: AtomicUsize,
        last_image: Mutex<Option<String>>,
        last_tags: Mutex<Option<BTreeMap<String, String>>>,
    }

    fn owned_instance(id: &str, state: InstanceState) -> Instance {
        let mut tag_map: HashMap<String, String> =
            tags::standard_tags().into_iter().collect();
        tag_map.insert("Name".to_string(), format!("name-{id}"));
        Instance {
            id: id.to_string(),
            name: Some(format!("name-{id}")),
            state,
            instance_type: "t3.micro".to_string(),
            public_ip: None,
            tags: tag_map,
        }
    }

    fn foreign_instance(id: &str, state: InstanceState) -> Instance {
        Instance {
            id: id.to_string(),
            name: None,
            state,
            instance_type: "t3.micro".to_string(),
            public_ip: None,
            tags: HashMap::from([(tags::MARKER_KEY.to_string(), "someone-else".to_string())]),
        }
    }

    #[async_trait]
    impl ComputeApi for FakeCompute {
        async fn list_owned(&self) -> Result<Vec<Instance>, ProviderError> {
            Ok(self.instances.lock().unwrap().clone())
        }

        async fn describe(&self, id: &str) -> Result<Option<Instance>, ProviderError> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .find(|i| i.id == id)
                .cloned())
        }

        async fn resolve_image(&self, _os: OsImage) -> Result<String, ProviderError> {
            self.image
                .clone()
                .ok_or_else(|| ProviderError::Api("ssm unavailable".to_string()))
        }

        async fn run_instance(
            &self,
            image_id: &str,
            _instance_type: &str,
            tags: &BTreeMap<String, String>,
        ) -> Result<String, ProviderError> {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_image.lock().unwrap() = Some(image_id.to_string());
            *self.last_tags.lock().unwrap() = Some(tags.clone());
            Ok("i-new".to_string())
        }

        async fn start(&self, _id: &str) -> Result<(), ProviderError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _id: &str) -> Result<(), ProviderError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn terminate(&self, _id: &str) -> Result<(), ProviderError> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn modify_instance_type(
            &self,
            _id: &str,
            _instance_type: &str,
        ) -> Result<(), ProviderError> {
            self.modify_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "web-01".to_string(),
            os: OsImage::AmazonLinux,
            instance_type: "t3.micro".to_string(),
        }
    }

    #[tokio::test]
    async fn create_rejected_at_capacity_without_provider_call() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![
                owned_instance("i-1", InstanceState::Running),
                owned_instance("i-2", InstanceState::Stopped),
            ]),
            image: Some("ami-123".to_string()),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        let err = manager.create(&spec()).await.unwrap_err();
        assert_eq!(
            err,
            OpError::Guard(GuardError::CapacityExceeded { active: 2, limit: 2 })
        );
        assert!(err.to_string().contains("limit reached (2/2)"));
        assert_eq!(manager.api.run_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminated_instances_do_not_count_against_capacity() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![
                owned_instance("i-1", InstanceState::Terminated),
                owned_instance("i-2", InstanceState::Terminated),
                owned_instance("i-3", InstanceState::Running),
            ]),
            image: Some("ami-123".to_string()),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        assert_eq!(manager.create(&spec()).await.unwrap(), "i-new");
        assert_eq!(manager.api.run_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_rejects_disallowed_type_without_provider_call() {
        let fake = FakeCompute {
            image: Some("ami-123".to_string()),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        let mut big = spec();
        big.instance_type = "m5.4xlarge".to_string();
        let err = manager.create(&big).await.unwrap_err();
        assert!(matches!(
            err,
            OpError::Guard(GuardError::TypeNotAllowed { .. })
        ));
        assert_eq!(manager.api.run_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn create_falls_back_to_hardcoded_ami_when_lookup_fails() {
        let fake = FakeCompute::default();
        let manager = ComputeManager::with_api(fake);
        manager.create(&spec()).await.unwrap();
        assert_eq!(
            manager.api.last_image.lock().unwrap().as_deref(),
            Some(OsImage::AmazonLinux.fallback_ami())
        );
    }

    #[tokio::test]
    async fn create_stamps_marker_and_name_tags() {
        let fake = FakeCompute {
            image: Some("ami-123".to_string()),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        manager.create(&spec()).await.unwrap();
        let stamped = manager.api.last_tags.lock().unwrap().clone().unwrap();
        assert_eq!(
            stamped.get(tags::MARKER_KEY).map(String::as_str),
            Some(tags::MARKER_VALUE)
        );
        assert_eq!(
            stamped.get(tags::PROJECT_KEY).map(String::as_str),
            Some(tags::PROJECT_VALUE)
        );
        assert!(stamped.contains_key(tags::OWNER_KEY));
        assert_eq!(stamped.get("Name").map(String::as_str), Some("web-01"));
    }

    #[tokio::test]
    async fn resize_requires_stopped_state() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![owned_instance("i-1", InstanceState::Running)]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        let err = manager.resize("i-1", "t2.small").await.unwrap_err();
        assert!(matches!(err, OpError::Guard(GuardError::Precondition(_))));
        assert_eq!(manager.api.modify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resize_enforces_allowlist() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![owned_instance("i-1", InstanceState::Stopped)]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        let err = manager.resize("i-1", "c5.large").await.unwrap_err();
        assert!(matches!(
            err,
            OpError::Guard(GuardError::TypeNotAllowed { .. })
        ));
        assert_eq!(manager.api.modify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreign_instance_transitions_are_denied_before_provider_call() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![foreign_instance("i-x", InstanceState::Running)]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        assert_eq!(manager.stop("i-x").await.unwrap_err(), OpError::AccessDenied);
        assert_eq!(
            manager.terminate("i-x").await.unwrap_err(),
            OpError::AccessDenied
        );
        assert_eq!(manager.api.stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.api.terminate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_instance_is_denied_not_distinguished() {
        let manager = ComputeManager::with_api(FakeCompute::default());
        assert_eq!(
            manager.start("i-missing").await.unwrap_err(),
            OpError::AccessDenied
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![
                owned_instance("i-run", InstanceState::Running),
                owned_instance("i-stop", InstanceState::Stopped),
                owned_instance("i-gone", InstanceState::Terminated),
            ]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        // start requires stopped, stop requires running, terminate excludes
        // already-terminated instances.
        assert!(manager.start("i-run").await.is_err());
        assert!(manager.stop("i-stop").await.is_err());
        assert!(manager.terminate("i-gone").await.is_err());
        assert_eq!(manager.api.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.api.stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.api.terminate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn legal_transitions_reach_provider() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![
                owned_instance("i-run", InstanceState::Running),
                owned_instance("i-stop", InstanceState::Stopped),
            ]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        manager.stop("i-run").await.unwrap();
        manager.start("i-stop").await.unwrap();
        manager.terminate("i-run").await.unwrap();
        assert_eq!(manager.api.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.api.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.api.terminate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn instance_record_serializes_with_kebab_case_state() {
        let instance = owned_instance("i-1", InstanceState::ShuttingDown);
        let value = serde_json::to_value(&instance).unwrap();
        assert_eq!(value["state"], "shutting-down");
        assert_eq!(value["id"], "i-1");
        // The tag map is internal; it must not leak into the JSON feed.
        assert!(value.get("tags").is_none());
        let spec: LaunchSpec =
            serde_json::from_value(serde_json::json!({
                "name": "web-01",
                "os": "amazon-linux",
                "instance_type": "t3.micro"
            }))
            .unwrap();
        assert_eq!(spec.os, OsImage::AmazonLinux);
    }

    #[tokio::test]
    async fn list_drops_foreign_entries() {
        let fake = FakeCompute {
            instances: Mutex::new(vec![
                owned_instance("i-1", InstanceState::Running),
                foreign_instance("i-x", InstanceState::Running),
            ]),
            ..Default::default()
        };
        let manager = ComputeManager::with_api(fake);
        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "i-1");
    }
}
