//! Health measurement mapping
//! This module turns raw characteristic notifications into typed measurements.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    UUID_BLOOD_PRESSURE_MEASUREMENT, UUID_HEART_RATE_MEASUREMENT, UUID_WEIGHT_MEASUREMENT,
};

/// A typed measurement decoded from a characteristic notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Measurement {
    Weight {
        /// Body weight in kilograms
        kilograms: f64,
        /// Time stamp reported by the device, if present
        timestamp: Option<DateTime<Utc>>,
    },
    BloodPressure {
        /// Systolic pressure in mmHg
        systolic: f64,
        /// Diastolic pressure in mmHg
        diastolic: f64,
        /// Mean arterial pressure in mmHg
        mean_arterial: f64,
        /// Pulse rate in beats per minute, if present
        pulse_rate: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    },
    HeartRate {
        beats_per_minute: u16,
    },
}

/// Maps raw characteristic payloads to typed measurements.
///
/// Implementations must be cheap and side-effect free: they are called for
/// every notification on the connector's delivery task.
pub trait MeasurementMapper: Send + Sync {
    /// Returns true if notifications of this characteristic should be subscribed to
    fn recognises(&self, characteristic: Uuid) -> bool;

    /// Converts a raw payload, or returns None if it cannot be interpreted
    fn map(&self, characteristic: Uuid, data: &[u8]) -> Option<Measurement>;
}

const KG_PER_LB: f64 = 0.453_592_37;
const KPA_TO_MMHG: f64 = 7.500_616_83;

/// Mapper for the Bluetooth SIG weight scale, blood pressure and heart rate profiles
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardMeasurementMapper;

impl StandardMeasurementMapper {
    pub fn new() -> Self {
        Self
    }

    fn parse_weight(data: &[u8]) -> Option<Measurement> {
        let flags = *data.first()?;
        let raw = u16::from_le_bytes([*data.get(1)?, *data.get(2)?]) as f64;
        let imperial = flags & 0x01 != 0;
        let kilograms = if imperial {
            raw * 0.01 * KG_PER_LB
        } else {
            raw * 0.005
        };
        let timestamp = if flags & 0x02 != 0 {
            parse_date_time(data.get(3..10)?)
        } else {
            None
        };
        Some(Measurement::Weight {
            kilograms,
            timestamp,
        })
    }

    fn parse_blood_pressure(data: &[u8]) -> Option<Measurement> {
        let flags = *data.first()?;
        let kpa = flags & 0x01 != 0;
        let to_mmhg = |value: f64| if kpa { value * KPA_TO_MMHG } else { value };

        let systolic = to_mmhg(parse_sfloat(data.get(1..3)?)?);
        let diastolic = to_mmhg(parse_sfloat(data.get(3..5)?)?);
        let mean_arterial = to_mmhg(parse_sfloat(data.get(5..7)?)?);

        let mut offset = 7;
        let timestamp = if flags & 0x02 != 0 {
            let ts = parse_date_time(data.get(offset..offset + 7)?);
            offset += 7;
            ts
        } else {
            None
        };
        let pulse_rate = if flags & 0x04 != 0 {
            parse_sfloat(data.get(offset..offset + 2)?)
        } else {
            None
        };

        Some(Measurement::BloodPressure {
            systolic,
            diastolic,
            mean_arterial,
            pulse_rate,
            timestamp,
        })
    }

    fn parse_heart_rate(data: &[u8]) -> Option<Measurement> {
        let flags = *data.first()?;
        let beats_per_minute = if flags & 0x01 != 0 {
            u16::from_le_bytes([*data.get(1)?, *data.get(2)?])
        } else {
            *data.get(1)? as u16
        };
        Some(Measurement::HeartRate { beats_per_minute })
    }
}

impl MeasurementMapper for StandardMeasurementMapper {
    fn recognises(&self, characteristic: Uuid) -> bool {
        characteristic == UUID_WEIGHT_MEASUREMENT
            || characteristic == UUID_BLOOD_PRESSURE_MEASUREMENT
            || characteristic == UUID_HEART_RATE_MEASUREMENT
    }

    fn map(&self, characteristic: Uuid, data: &[u8]) -> Option<Measurement> {
        if characteristic == UUID_WEIGHT_MEASUREMENT {
            Self::parse_weight(data)
        } else if characteristic == UUID_BLOOD_PRESSURE_MEASUREMENT {
            Self::parse_blood_pressure(data)
        } else if characteristic == UUID_HEART_RATE_MEASUREMENT {
            Self::parse_heart_rate(data)
        } else {
            None
        }
    }
}

/// Decodes an IEEE-11073 16-bit SFLOAT. NaN, NRes and the infinities yield None.
fn parse_sfloat(bytes: &[u8]) -> Option<f64> {
    let raw = u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]);
    let mantissa_bits = raw & 0x0FFF;
    if matches!(mantissa_bits, 0x07FF | 0x0800 | 0x07FE | 0x0802 | 0x0801) {
        return None;
    }
    // sign-extend the 12-bit mantissa and the 4-bit exponent
    let mantissa = ((mantissa_bits << 4) as i16 >> 4) as f64;
    let exponent = ((raw as i16) >> 12) as i32;
    Some(mantissa * 10f64.powi(exponent))
}

/// Decodes the 7-byte Date Time characteristic format. A zero year means unknown.
fn parse_date_time(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let year = u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]);
    if year == 0 {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year as i32, *bytes.get(2)? as u32, *bytes.get(3)? as u32)?;
    let time = date.and_hms_opt(
        *bytes.get(4)? as u32,
        *bytes.get(5)? as u32,
        *bytes.get(6)? as u32,
    )?;
    Some(time.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_only_health_characteristics() {
        let mapper = StandardMeasurementMapper::new();
        assert!(mapper.recognises(UUID_WEIGHT_MEASUREMENT));
        assert!(mapper.recognises(UUID_BLOOD_PRESSURE_MEASUREMENT));
        assert!(mapper.recognises(UUID_HEART_RATE_MEASUREMENT));
        assert!(!mapper.recognises(crate::core::bluetooth::UUID_BATTERY_LEVEL));
    }

    #[test]
    fn weight_in_si_units() {
        // 0x3A98 = 15000 * 0.005 kg = 75 kg
        let data = [0x00, 0x98, 0x3A];
        let measurement = StandardMeasurementMapper.map(UUID_WEIGHT_MEASUREMENT, &data);
        match measurement {
            Some(Measurement::Weight { kilograms, timestamp }) => {
                assert!((kilograms - 75.0).abs() < 1e-9);
                assert!(timestamp.is_none());
            }
            other => panic!("unexpected measurement {other:?}"),
        }
    }

    #[test]
    fn weight_in_pounds_with_timestamp() {
        // 16534 * 0.01 lb = 165.34 lb, 2024-03-05 07:30:00
        let mut data = vec![0x03];
        data.extend_from_slice(&16534u16.to_le_bytes());
        data.extend_from_slice(&2024u16.to_le_bytes());
        data.extend_from_slice(&[3, 5, 7, 30, 0]);
        match StandardMeasurementMapper.map(UUID_WEIGHT_MEASUREMENT, &data) {
            Some(Measurement::Weight { kilograms, timestamp }) => {
                assert!((kilograms - 165.34 * KG_PER_LB).abs() < 1e-9);
                let ts = timestamp.expect("timestamp");
                assert_eq!(ts.to_rfc3339(), "2024-03-05T07:30:00+00:00");
            }
            other => panic!("unexpected measurement {other:?}"),
        }
    }

    #[test]
    fn blood_pressure_with_pulse() {
        // mmHg, pulse present: 120 / 80 / 93, pulse 72
        let data = [0x04, 120, 0x00, 80, 0x00, 93, 0x00, 72, 0x00];
        match StandardMeasurementMapper.map(UUID_BLOOD_PRESSURE_MEASUREMENT, &data) {
            Some(Measurement::BloodPressure {
                systolic,
                diastolic,
                mean_arterial,
                pulse_rate,
                timestamp,
            }) => {
                assert_eq!(systolic, 120.0);
                assert_eq!(diastolic, 80.0);
                assert_eq!(mean_arterial, 93.0);
                assert_eq!(pulse_rate, Some(72.0));
                assert!(timestamp.is_none());
            }
            other => panic!("unexpected measurement {other:?}"),
        }
    }

    #[test]
    fn heart_rate_both_formats() {
        assert_eq!(
            StandardMeasurementMapper.map(UUID_HEART_RATE_MEASUREMENT, &[0x00, 64]),
            Some(Measurement::HeartRate { beats_per_minute: 64 })
        );
        assert_eq!(
            StandardMeasurementMapper.map(UUID_HEART_RATE_MEASUREMENT, &[0x01, 0x2C, 0x01]),
            Some(Measurement::HeartRate { beats_per_minute: 300 })
        );
    }

    #[test]
    fn truncated_payloads_are_not_recognised() {
        assert_eq!(StandardMeasurementMapper.map(UUID_WEIGHT_MEASUREMENT, &[0x00, 0x01]), None);
        assert_eq!(StandardMeasurementMapper.map(UUID_BLOOD_PRESSURE_MEASUREMENT, &[0x00]), None);
        assert_eq!(StandardMeasurementMapper.map(UUID_HEART_RATE_MEASUREMENT, &[]), None);
    }

    #[test]
    fn sfloat_handles_negative_exponent_and_special_values() {
        // exponent -1 (0xF), mantissa 725 -> 72.5
        let raw: u16 = (0xF << 12) | 725;
        let value = parse_sfloat(&raw.to_le_bytes()).expect("finite value");
        assert!((value - 72.5).abs() < 1e-9);
        assert_eq!(parse_sfloat(&0x07FFu16.to_le_bytes()), None);
    }
}
