//! Serde adapter that stores a value in its string form.
//!
//! For event fields whose type has no serde support of its own but implements
//! `Display` and `FromStr` (codes, quantities with units, external ids):
//!
//! ```ignore
//! #[serde(with = "factory_events::registry::as_string")]
//! work_center: WorkCenterCode,
//! ```

use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(de::Error::custom)
}
