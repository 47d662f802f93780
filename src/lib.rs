pub mod aws;
pub mod guard;
pub mod manager;
pub mod tags;

pub mod prelude {
    pub use crate::aws::{
        compute::{ComputeManager, Ec2Compute, Instance, InstanceState, LaunchSpec, OsImage},
        dns::{DnsManager, HostedZone, RecordSet, Route53Dns},
        load_config,
        storage::{Bucket, S3Storage, StorageManager},
    };
    pub use crate::guard::{GuardError, GuardPolicy};
    pub use crate::manager::{OpError, OpResult, ProviderError};
}
