//! Route 53 manager.
//!
//! Hosted zones carry no tags on the list path, so ownership rides on the
//! zone comment field: a zone is ours iff its comment equals the marker
//! string exactly. Record mutation under a zone we do not own is rejected
//! before the change batch is ever assembled.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, HostedZoneConfig, ResourceRecord, ResourceRecordSet, RrType,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::manager::{OpError, OpResult, ProviderError};
use crate::tags;

/// A records created through the portal always use this TTL.
const RECORD_TTL: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedZone {
    /// Bare zone id, without the `/hostedzone/` prefix.
    pub id: String,
    pub name: String,
    pub record_count: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSet {
    pub name: String,
    pub kind: String,
    pub ttl: i64,
    pub values: Vec<String>,
}

#[async_trait]
pub trait DnsApi: Send + Sync {
    async fn create_zone(&self, name: &str, comment: &str) -> Result<HostedZone, ProviderError>;
    async fn list_zones(&self) -> Result<Vec<HostedZone>, ProviderError>;
    async fn get_zone(&self, id: &str) -> Result<Option<HostedZone>, ProviderError>;
    async fn upsert_a_record(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        ttl: i64,
    ) -> Result<(), ProviderError>;
    async fn delete_a_record(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        ttl: i64,
    ) -> Result<(), ProviderError>;
    async fn list_records(&self, zone_id: &str) -> Result<Vec<RecordSet>, ProviderError>;
}

pub struct Route53Dns {
    client: aws_sdk_route53::Client,
}

impl Route53Dns {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_route53::Client::new(config),
        }
    }
}

fn normalize_zone(zone: &aws_sdk_route53::types::HostedZone) -> HostedZone {
    HostedZone {
        id: zone.id().trim_start_matches("/hostedzone/").to_string(),
        name: zone.name().to_string(),
        record_count: zone.resource_record_set_count().unwrap_or(0),
        comment: zone
            .config()
            .and_then(|c| c.comment())
            .map(|c| c.to_string()),
    }
}

fn a_record_change(
    action: ChangeAction,
    name: &str,
    ip: &str,
    ttl: i64,
) -> Result<Change, ProviderError> {
    let record = ResourceRecord::builder()
        .value(ip)
        .build()
        .map_err(|e| ProviderError::Api(e.to_string()))?;
    let record_set = ResourceRecordSet::builder()
        .name(name)
        .r#type(RrType::A)
        .ttl(ttl)
        .resource_records(record)
        .build()
        .map_err(|e| ProviderError::Api(e.to_string()))?;
    Change::builder()
        .action(action)
        .resource_record_set(record_set)
        .build()
        .map_err(|e| ProviderError::Api(e.to_string()))
}

#[async_trait]
impl DnsApi for Route53Dns {
    async fn create_zone(&self, name: &str, comment: &str) -> Result<HostedZone, ProviderError> {
        let caller_reference = format!("{}-{}", name, Utc::now().timestamp());
        let response = self
            .client
            .create_hosted_zone()
            .name(name)
            .caller_reference(caller_reference)
            .hosted_zone_config(HostedZoneConfig::builder().comment(comment).build())
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        response
            .hosted_zone
            .as_ref()
            .map(normalize_zone)
            .ok_or_else(|| ProviderError::Api("create_hosted_zone returned no zone".to_string()))
    }

    async fn list_zones(&self) -> Result<Vec<HostedZone>, ProviderError> {
        let response = self
            .client
            .list_hosted_zones()
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        Ok(response.hosted_zones().iter().map(normalize_zone).collect())
    }

    async fn get_zone(&self, id: &str) -> Result<Option<HostedZone>, ProviderError> {
        match self.client.get_hosted_zone().id(id).send().await {
            Ok(response) => Ok(response.hosted_zone.as_ref().map(normalize_zone)),
            Err(e) => {
                if e.as_service_error()
                    .map(|se| se.is_no_such_hosted_zone())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(ProviderError::Api(format!("{:?}", e.into_source())))
                }
            }
        }
    }

    async fn upsert_a_record(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        ttl: i64,
    ) -> Result<(), ProviderError> {
        self.change(zone_id, a_record_change(ChangeAction::Upsert, name, ip, ttl)?)
            .await
    }

    async fn delete_a_record(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        ttl: i64,
    ) -> Result<(), ProviderError> {
        self.change(zone_id, a_record_change(ChangeAction::Delete, name, ip, ttl)?)
            .await
    }

    async fn list_records(&self, zone_id: &str) -> Result<Vec<RecordSet>, ProviderError> {
        let response = self
            .client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        Ok(response
            .resource_record_sets()
            .iter()
            .map(|r| RecordSet {
                name: r.name().to_string(),
                kind: r.r#type().as_str().to_string(),
                ttl: r.ttl().unwrap_or(0),
                values: r
                    .resource_records()
                    .iter()
                    .map(|v| v.value().to_string())
                    .collect(),
            })
            .collect())
    }
}

impl Route53Dns {
    async fn change(&self, zone_id: &str, change: Change) -> Result<(), ProviderError> {
        let batch = ChangeBatch::builder()
            .comment(tags::ZONE_MARKER)
            .changes(change)
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;
        self.client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }
}

pub struct DnsManager<A: DnsApi> {
    api: A,
}

impl DnsManager<Route53Dns> {
    pub fn new(config: &SdkConfig) -> Self {
        Self::with_api(Route53Dns::new(config))
    }
}

impl<A: DnsApi> DnsManager<A> {
    pub fn with_api(api: A) -> Self {
        Self { api }
    }

    pub async fn create_zone(&self, name: &str) -> OpResult<HostedZone> {
        let zone = self.api.create_zone(name, tags::ZONE_MARKER).await?;
        info!(zone = %zone.id, %name, "hosted zone created");
        Ok(zone)
    }

    pub async fn list_zones(&self) -> OpResult<Vec<HostedZone>> {
        let mut zones = self.api.list_zones().await?;
        zones.retain(|z| tags::zone_is_owned(z.comment.as_deref()));
        Ok(zones)
    }

    pub async fn create_record(&self, zone_id: &str, name: &str, ip: &str) -> OpResult<()> {
        self.verify_zone(zone_id).await?;
        self.api
            .upsert_a_record(zone_id, name, ip, RECORD_TTL)
            .await?;
        info!(zone = %zone_id, record = %name, %ip, "A record upserted");
        Ok(())
    }

    pub async fn delete_record(&self, zone_id: &str, name: &str, ip: &str) -> OpResult<()> {
        self.verify_zone(zone_id).await?;
        self.api
            .delete_a_record(zone_id, name, ip, RECORD_TTL)
            .await?;
        info!(zone = %zone_id, record = %name, "A record deleted");
        Ok(())
    }

    pub async fn list_records(&self, zone_id: &str) -> OpResult<Vec<RecordSet>> {
        self.verify_zone(zone_id).await?;
        Ok(self.api.list_records(zone_id).await?)
    }

    /// Comment-marker ownership gate; a fetch failure or missing zone is
    /// indistinguishable from a foreign zone.
    async fn verify_zone(&self, zone_id: &str) -> OpResult<()> {
        match self.api.get_zone(zone_id).await {
            Ok(Some(zone)) if tags::zone_is_owned(zone.comment.as_deref()) => Ok(()),
            Ok(_) => Err(OpError::AccessDenied),
            Err(_) => Err(OpError::AccessDenied),
        }
    }
}
