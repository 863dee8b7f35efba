//! Protobuf wire format shared by the device simulator and the processor.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use super::routine::DeviceStatus;

/// Content type attached to every published routine.
pub const CONTENT_TYPE: &str = "application/protobuf";

/// Routine report as published by a device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceRoutine {
    /// Device identifier.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "DeviceStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub context: String,
    #[prost(string, tag = "4")]
    pub diagnostics: String,
    #[prost(string, tag = "5")]
    pub area: String,
    #[prost(message, optional, tag = "6")]
    pub dispatched_at: Option<Timestamp>,
}

impl DeviceRoutine {
    pub fn new(
        device_id: impl Into<String>,
        status: DeviceStatus,
        context: impl Into<String>,
        diagnostics: impl Into<String>,
        area: impl Into<String>,
        dispatched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: device_id.into(),
            status: status.into(),
            context: context.into(),
            diagnostics: diagnostics.into(),
            area: area.into(),
            dispatched_at: Some(to_timestamp(dispatched_at)),
        }
    }
}

pub fn to_timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

/// `None` if the timestamp is outside chrono's range or has negative nanos.
pub fn to_datetime(ts: &Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos).ok()?;
    DateTime::from_timestamp(ts.seconds, nanos)
}
