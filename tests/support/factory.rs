#![allow(dead_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use factory_events::registry::as_string;
use factory_events::{impl_aggregate, impl_event, timestamp, Entity, EventRegistry};
use serde::{Deserialize, Serialize};

/// Work center codes look like `WC-<digits>`; serialized as that string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkCenterCode(u32);

impl WorkCenterCode {
    pub fn new(number: u32) -> Self {
        Self(number)
    }
}

impl fmt::Display for WorkCenterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WC-{:03}", self.0)
    }
}

impl FromStr for WorkCenterCode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.strip_prefix("WC-")
            .and_then(|digits| digits.parse().ok())
            .map(WorkCenterCode)
            .ok_or_else(|| format!("not a work center code: {raw}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOpened {
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub product_sku: String,
    pub quantity: u32,
    #[serde(with = "as_string")]
    pub work_center: WorkCenterCode,
}
impl_event!(BatchOpened);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchClosed {
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub good: u32,
    pub scrap: u32,
    pub status: BatchStatus,
}
impl_event!(BatchClosed);

/// Never registered; raising it makes a commit fail serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNote {
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub text: String,
}
impl_event!(OperatorNote);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRegistered {
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub sku: String,
    pub name: String,
}
impl_event!(ProductRegistered);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRetired {
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub reason: Option<String>,
}
impl_event!(ProductRetired);

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Batch {
    #[serde(skip)]
    entity: Entity,
    pub product_sku: String,
    pub quantity: u32,
    pub status: BatchStatus,
    pub good: u32,
    pub scrap: u32,
}
impl_aggregate!(Batch, "batch", entity);

impl Batch {
    pub fn open(id: &str, product_sku: &str, quantity: u32, work_center: WorkCenterCode) -> Self {
        let mut batch = Batch {
            entity: Entity::with_id(id),
            product_sku: product_sku.to_string(),
            quantity,
            ..Batch::default()
        };
        batch.entity.raise(BatchOpened {
            aggregate_id: id.to_string(),
            occurred_at: timestamp(),
            product_sku: product_sku.to_string(),
            quantity,
            work_center,
        });
        batch
    }

    pub fn close(&mut self, good: u32, scrap: u32) {
        self.status = BatchStatus::Closed;
        self.good = good;
        self.scrap = scrap;
        let aggregate_id = self.entity.id().to_string();
        self.entity.raise(BatchClosed {
            aggregate_id,
            occurred_at: timestamp(),
            good,
            scrap,
            status: BatchStatus::Closed,
        });
    }

    pub fn note(&mut self, text: &str) {
        let aggregate_id = self.entity.id().to_string();
        self.entity.raise(OperatorNote {
            aggregate_id,
            occurred_at: timestamp(),
            text: text.to_string(),
        });
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(skip)]
    entity: Entity,
    pub sku: String,
    pub name: String,
    pub retired: bool,
}
impl_aggregate!(Product, "product", entity);

impl Product {
    pub fn register(id: &str, sku: &str, name: &str) -> Self {
        let mut product = Product {
            entity: Entity::with_id(id),
            sku: sku.to_string(),
            name: name.to_string(),
            retired: false,
        };
        product.entity.raise(ProductRegistered {
            aggregate_id: id.to_string(),
            occurred_at: timestamp(),
            sku: sku.to_string(),
            name: name.to_string(),
        });
        product
    }

    pub fn retire(&mut self, reason: Option<&str>) {
        self.retired = true;
        let aggregate_id = self.entity.id().to_string();
        self.entity.raise(ProductRetired {
            aggregate_id,
            occurred_at: timestamp(),
            reason: reason.map(str::to_string),
        });
    }
}

pub const BATCH_OPENED: &str = "production.batch_opened";
pub const BATCH_CLOSED: &str = "production.batch_closed";
pub const PRODUCT_REGISTERED: &str = "catalog.product_registered";
pub const PRODUCT_RETIRED: &str = "catalog.product_retired";

pub fn registry() -> Arc<EventRegistry> {
    Arc::new(
        EventRegistry::builder()
            .register::<BatchOpened>(BATCH_OPENED, 1)
            .unwrap()
            .register::<BatchClosed>(BATCH_CLOSED, 1)
            .unwrap()
            .register::<ProductRegistered>(PRODUCT_REGISTERED, 1)
            .unwrap()
            .register::<ProductRetired>(PRODUCT_RETIRED, 1)
            .unwrap()
            .build(),
    )
}
