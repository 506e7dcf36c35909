//! Read side for dashboards: stored aggregates per device, or rolled up over
//! every device of a classroom.

use std::sync::Arc;

use ledger_client::{
    domain::{rollup_by_bucket, BucketTotal, Granularity, SwitchScope},
    AggregateStore,
};
use time::Date;

use crate::{
    aggregate::Bucket,
    catalog::DeviceCatalog,
    error::{Result, ServiceError},
};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryTarget {
    Device {
        device_id: String,
        scope: SwitchScope,
    },
    Classroom(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub target: QueryTarget,
    /// Inclusive local dates.
    pub from: Date,
    pub to: Date,
    pub granularity: Granularity,
}

pub struct AggregateReader {
    store: Arc<dyn AggregateStore>,
    catalog: Arc<dyn DeviceCatalog>,
}

impl AggregateReader {
    pub fn new(store: Arc<dyn AggregateStore>, catalog: Arc<dyn DeviceCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn query(&self, q: &AggregateQuery) -> Result<Vec<BucketTotal>> {
        if q.to < q.from {
            return Err(ServiceError::InvalidInput("'to' is before 'from'".to_string()));
        }
        let (from_bucket, to_bucket) = match q.granularity {
            Granularity::Daily => (Bucket::day(q.from).label(), Bucket::day(q.to).label()),
            Granularity::Monthly => (Bucket::month_of(q.from).label(), Bucket::month_of(q.to).label()),
        };

        match &q.target {
            QueryTarget::Device { device_id, scope } => {
                let rows = self
                    .store
                    .aggregates(device_id, scope, q.granularity, &from_bucket, &to_bucket)
                    .await?;
                Ok(rollup_by_bucket(&rows))
            }
            QueryTarget::Classroom(room) => {
                let devices = self.catalog.devices_in_classroom(room);
                if devices.is_empty() {
                    return Err(ServiceError::NotFound(format!("no devices in classroom '{room}'")));
                }
                Ok(self
                    .store
                    .rollup(&devices, q.granularity, &from_bucket, &to_bucket)
                    .await?)
            }
        }
    }
}
