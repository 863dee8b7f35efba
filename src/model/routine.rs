//! Decoded routine events.

use std::fmt;

use chrono::{DateTime, Utc};
use prost::Message as _;
use uuid::Uuid;

use super::wire::{self, DeviceRoutine};
use crate::error::{Error, Result};

/// Health reported by a device.
///
/// Doubles as the protobuf enumeration on the wire; stored by name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    prost::Enumeration,
)]
#[repr(i32)]
pub enum DeviceStatus {
    Unspecified = 0,
    Healthy = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl DeviceStatus {
    /// Statuses a device can actually report.
    pub const REPORTABLE: [DeviceStatus; 4] = [
        DeviceStatus::Healthy,
        DeviceStatus::Warning,
        DeviceStatus::Error,
        DeviceStatus::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Unspecified => "UNSPECIFIED",
            DeviceStatus::Healthy => "HEALTHY",
            DeviceStatus::Warning => "WARNING",
            DeviceStatus::Error => "ERROR",
            DeviceStatus::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNSPECIFIED" => Ok(DeviceStatus::Unspecified),
            "HEALTHY" => Ok(DeviceStatus::Healthy),
            "WARNING" => Ok(DeviceStatus::Warning),
            "ERROR" => Ok(DeviceStatus::Error),
            "CRITICAL" => Ok(DeviceStatus::Critical),
            other => Err(Error::Decode(format!("unknown device status: {other}"))),
        }
    }
}

/// Status as received from a device.
///
/// Protobuf enums are open: a newer producer may send a value this build
/// does not know. Such values are kept and stored by their number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportedStatus {
    Known(DeviceStatus),
    Unrecognized(i32),
}

impl ReportedStatus {
    pub fn from_wire(value: i32) -> Self {
        match DeviceStatus::try_from(value) {
            Ok(status) => ReportedStatus::Known(status),
            Err(_) => ReportedStatus::Unrecognized(value),
        }
    }

    pub fn known(self) -> Option<DeviceStatus> {
        match self {
            ReportedStatus::Known(status) => Some(status),
            ReportedStatus::Unrecognized(_) => None,
        }
    }
}

impl From<DeviceStatus> for ReportedStatus {
    fn from(status: DeviceStatus) -> Self {
        ReportedStatus::Known(status)
    }
}

impl PartialEq<DeviceStatus> for ReportedStatus {
    fn eq(&self, other: &DeviceStatus) -> bool {
        *self == ReportedStatus::Known(*other)
    }
}

impl fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportedStatus::Known(status) => f.write_str(status.as_str()),
            ReportedStatus::Unrecognized(value) => write!(f, "{value}"),
        }
    }
}

/// A routine report as persisted by the processor.
///
/// `id` is generated on every decode and never derived from the payload, so
/// a redelivered message produces a distinct record.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineEvent {
    pub id: Uuid,
    pub device_id: String,
    pub status: ReportedStatus,
    pub context: String,
    pub diagnostics: String,
    pub area: String,
    /// Assigned by the producing device; the Unix epoch if it sent none.
    pub dispatched_at: DateTime<Utc>,
    /// Assigned when the payload was decoded.
    pub created_at: DateTime<Utc>,
}

impl RoutineEvent {
    /// Decode a protobuf payload into a new event.
    ///
    /// Fails with [`Error::Decode`] on malformed bytes or an out-of-range
    /// dispatch timestamp. Unknown status values are kept.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let wire = DeviceRoutine::decode(payload).map_err(|e| Error::Decode(e.to_string()))?;
        Self::from_wire(wire)
    }

    pub fn from_wire(wire: DeviceRoutine) -> Result<Self> {
        let status = ReportedStatus::from_wire(wire.status);

        let dispatched_at = match wire.dispatched_at.as_ref() {
            Some(ts) => wire::to_datetime(ts)
                .ok_or_else(|| Error::Decode(format!("dispatched_at out of range: {ts:?}")))?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            device_id: wire.id,
            status,
            context: wire.context,
            diagnostics: wire.diagnostics,
            area: wire.area,
            dispatched_at,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn status_names_round_trip_through_from_str() {
        for status in DeviceStatus::REPORTABLE {
            assert_eq!(status.as_str().parse::<DeviceStatus>().unwrap(), status);
        }
        assert!("BROKEN".parse::<DeviceStatus>().is_err());
    }

    fn sample(device_id: &str, status: DeviceStatus, area: &str) -> DeviceRoutine {
        DeviceRoutine::new(device_id, status, "routine", "Flow rate stable", area, Utc::now())
    }

    #[test]
    fn unknown_status_value_is_kept_by_number() {
        let mut wire = sample("device-1", DeviceStatus::Healthy, "A");
        wire.status = 5;
        let event = RoutineEvent::decode(&wire.encode_to_vec()).unwrap();
        assert_eq!(event.status, ReportedStatus::Unrecognized(5));
        assert_eq!(event.status.known(), None);
        assert_eq!(event.status.to_string(), "5");
    }

    #[test]
    fn missing_dispatch_timestamp_defaults_to_epoch() {
        let mut wire = sample("device-1", DeviceStatus::Healthy, "A");
        wire.dispatched_at = None;
        let event = RoutineEvent::decode(&wire.encode_to_vec()).unwrap();
        assert_eq!(event.dispatched_at, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(event.device_id, "device-1");
    }

    #[test]
    fn out_of_range_dispatch_timestamp_is_a_decode_error() {
        let mut wire = sample("device-1", DeviceStatus::Healthy, "A");
        wire.dispatched_at = Some(prost_types::Timestamp {
            seconds: i64::MAX,
            nanos: 0,
        });
        let err = RoutineEvent::decode(&wire.encode_to_vec()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "got {err:?}");
    }

    #[test]
    fn known_status_is_stored_by_name() {
        assert_eq!(ReportedStatus::from(DeviceStatus::Critical).to_string(), "CRITICAL");
        assert_eq!(ReportedStatus::from_wire(2), DeviceStatus::Warning);
    }

    #[test]
    fn created_at_is_not_before_dispatch() {
        let wire = sample("device-9", DeviceStatus::Warning, "B");
        let event = RoutineEvent::decode(&wire.encode_to_vec()).unwrap();
        assert!(event.created_at >= event.dispatched_at);
        assert_eq!(event.status, DeviceStatus::Warning);
        assert_eq!(event.device_id, "device-9");
        assert_eq!(event.area, "B");
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = RoutineEvent::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "got {err:?}");
    }
}
