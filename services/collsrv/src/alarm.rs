//! Edge-triggered alarm detection
//!
//! A sensor flagged as alarm is active while its value is > 0. Records are
//! opened on an inactive -> active change and closed on the reverse change;
//! the first reading of a sensor never changes alarm state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::model::{MachineId, Sensor};
use crate::store::{CycleWriter, NewAlarm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmTransition {
    Raised,
    Cleared,
}

/// Transition implied by a `(previous, current)` value pair
pub fn detect(previous: Option<f64>, current: f64) -> Option<AlarmTransition> {
    let previous = previous?;
    match (previous > 0.0, current > 0.0) {
        (false, true) => Some(AlarmTransition::Raised),
        (true, false) => Some(AlarmTransition::Cleared),
        _ => None,
    }
}

/// What applying a transition did to the alarm table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmOutcome {
    Opened(i64),
    Closed,
    /// Already in the target state, or the sensor is not an alarm
    Unchanged,
}

/// Applies transitions through the cycle writer of the current device pass
pub struct AlarmDetector;

impl AlarmDetector {
    pub async fn apply(
        writer: &mut dyn CycleWriter,
        machine_id: MachineId,
        sensor: &Sensor,
        transition: AlarmTransition,
        at: DateTime<Utc>,
    ) -> Result<AlarmOutcome> {
        let Some(meta) = sensor.spec.alarm.as_ref() else {
            return Ok(AlarmOutcome::Unchanged);
        };
        let alarm_code = sensor.spec.code.as_str();

        match transition {
            AlarmTransition::Raised => {
                if writer.has_open_alarm(sensor.id, alarm_code).await? {
                    debug!("Alarm {} already open for sensor {}", alarm_code, sensor.id);
                    return Ok(AlarmOutcome::Unchanged);
                }
                let id = writer
                    .open_alarm(&NewAlarm {
                        machine_id,
                        sensor_id: sensor.id,
                        alarm_code: alarm_code.to_string(),
                        alarm_name: sensor.spec.name.clone(),
                        severity: meta.severity.clone(),
                        color: meta.color.clone(),
                        opened_at: at,
                    })
                    .await?;
                Ok(AlarmOutcome::Opened(id))
            },
            AlarmTransition::Cleared => {
                if writer.close_alarm(sensor.id, alarm_code, at).await? {
                    Ok(AlarmOutcome::Closed)
                } else {
                    Ok(AlarmOutcome::Unchanged)
                }
            },
        }
    }

    /// Detect and apply in one step
    pub async fn evaluate(
        writer: &mut dyn CycleWriter,
        machine_id: MachineId,
        sensor: &Sensor,
        previous: Option<f64>,
        current: f64,
        at: DateTime<Utc>,
    ) -> Result<AlarmOutcome> {
        if !sensor.spec.is_alarm() {
            return Ok(AlarmOutcome::Unchanged);
        }
        match detect(previous, current) {
            Some(transition) => Self::apply(writer, machine_id, sensor, transition, at).await,
            None => Ok(AlarmOutcome::Unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reading_never_transitions() {
        assert_eq!(detect(None, 5.0), None);
        assert_eq!(detect(None, 0.0), None);
    }

    #[test]
    fn test_edges() {
        assert_eq!(detect(Some(0.0), 5.0), Some(AlarmTransition::Raised));
        assert_eq!(detect(Some(-1.0), 1.0), Some(AlarmTransition::Raised));
        assert_eq!(detect(Some(5.0), 0.0), Some(AlarmTransition::Cleared));
        assert_eq!(detect(Some(2.0), -3.0), Some(AlarmTransition::Cleared));
    }

    #[test]
    fn test_levels_do_not_transition() {
        assert_eq!(detect(Some(1.0), 2.0), None);
        assert_eq!(detect(Some(0.0), 0.0), None);
        assert_eq!(detect(Some(-2.0), 0.0), None);
    }
}
