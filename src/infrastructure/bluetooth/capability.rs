//! Capability handles
//!
//! A hub session holds one handle per attached device capability. Each
//! handle knows its port, the frames needed to enable it, and either how to
//! encode actuator commands or how to decode sensor values.

use crate::domain::models::{
    CapabilityDescriptor, CapabilityKind, Color, SensorMode, SensorValue,
};
use crate::error::HubError;
use crate::infrastructure::bluetooth::protocol;
use std::sync::Arc;

/// Minimum change before the hub reports a new sensor value
const SENSOR_DELTA: u32 = 1;

pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> CapabilityKind;
    fn port(&self) -> u8;

    /// Frames written right after the link comes up.
    fn setup_frames(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn actuator(&self) -> Option<&dyn Actuator> {
        None
    }

    fn sensor(&self) -> Option<&dyn Sensor> {
        None
    }
}

/// Speed-controlled output.
pub trait Actuator {
    fn set_speed_payload(&self, speed: i8) -> Vec<u8>;
    fn ramp_payload(&self, target: i8, duration_ms: u16) -> Vec<u8>;
}

/// Source of decoded value updates.
pub trait Sensor {
    fn decode(&self, raw: &[u8]) -> Result<SensorValue, HubError>;
}

/// Build the handle described by `descriptor`.
pub fn attach(descriptor: &CapabilityDescriptor) -> Result<Arc<dyn Capability>, HubError> {
    match descriptor.kind {
        CapabilityKind::TrainMotor => {
            if !descriptor.sub_capabilities.is_empty() {
                return Err(HubError::InvalidArgument(format!(
                    "motor {} takes no sensor sub-capabilities",
                    descriptor.name
                )));
            }
            Ok(Arc::new(TrainMotor {
                name: descriptor.name.clone(),
                port: descriptor.port,
            }))
        }
        CapabilityKind::VisionSensor => match descriptor.sub_capabilities.as_slice() {
            [mode] => Ok(Arc::new(VisionSensor {
                name: descriptor.name.clone(),
                port: descriptor.port,
                mode: *mode,
            })),
            [] => Err(HubError::InvalidArgument(format!(
                "vision sensor {} needs one sub-capability",
                descriptor.name
            ))),
            _ => Err(HubError::InvalidArgument(format!(
                "vision sensor {} supports a single active sub-capability",
                descriptor.name
            ))),
        },
    }
}

pub struct TrainMotor {
    name: String,
    port: u8,
}

impl Capability for TrainMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::TrainMotor
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn actuator(&self) -> Option<&dyn Actuator> {
        Some(self)
    }
}

impl Actuator for TrainMotor {
    fn set_speed_payload(&self, speed: i8) -> Vec<u8> {
        protocol::encode_set_power(self.port, speed)
    }

    fn ramp_payload(&self, target: i8, duration_ms: u16) -> Vec<u8> {
        protocol::encode_ramp(self.port, target, duration_ms)
    }
}

/// Colour and distance sensor.
pub struct VisionSensor {
    name: String,
    port: u8,
    mode: SensorMode,
}

impl Capability for VisionSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::VisionSensor
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn setup_frames(&self) -> Vec<Vec<u8>> {
        vec![protocol::encode_input_format_setup(
            self.port,
            self.mode.mode_number(),
            SENSOR_DELTA,
            true,
        )]
    }

    fn sensor(&self) -> Option<&dyn Sensor> {
        Some(self)
    }
}

impl Sensor for VisionSensor {
    fn decode(&self, raw: &[u8]) -> Result<SensorValue, HubError> {
        let first = *raw.first().ok_or_else(|| {
            HubError::Protocol(format!("empty value update from {}", self.name))
        })?;
        Ok(match self.mode {
            SensorMode::SenseColor => SensorValue::Color(Color::from(first)),
            SensorMode::SenseDistance => SensorValue::Distance(first),
            SensorMode::SenseReflectivity => SensorValue::Reflectivity(first),
            SensorMode::SenseAmbient => SensorValue::Ambient(first),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{parse_frame, Frame};

    #[test]
    fn test_motor_is_actuator_only() {
        let motor = attach(&CapabilityDescriptor::motor("motor", 0)).unwrap();
        assert!(motor.sensor().is_none());
        assert!(motor.setup_frames().is_empty());
        let payload = motor.actuator().unwrap().set_speed_payload(20);
        assert_eq!(
            parse_frame(&payload).unwrap(),
            Frame::SetPower { port: 0, power: 20 }
        );
    }

    #[test]
    fn test_colour_sensor_setup_and_decode() {
        let sensor = attach(&CapabilityDescriptor::vision_sensor(
            "train_sensor",
            1,
            &[SensorMode::SenseColor],
        ))
        .unwrap();
        assert!(sensor.actuator().is_none());
        assert_eq!(
            parse_frame(&sensor.setup_frames()[0]).unwrap(),
            Frame::InputFormatSetup {
                port: 1,
                mode: 0,
                delta: 1,
                notify: true
            }
        );

        let decoder = sensor.sensor().unwrap();
        assert_eq!(
            decoder.decode(&[7]).unwrap(),
            SensorValue::Color(Color::Yellow)
        );
        assert!(decoder.decode(&[]).is_err());
    }

    #[test]
    fn test_distance_mode() {
        let sensor = attach(&CapabilityDescriptor::vision_sensor(
            "eye",
            1,
            &[SensorMode::SenseDistance],
        ))
        .unwrap();
        assert_eq!(
            sensor.sensor().unwrap().decode(&[4]).unwrap(),
            SensorValue::Distance(4)
        );
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(matches!(
            attach(&CapabilityDescriptor::vision_sensor("eye", 1, &[])),
            Err(HubError::InvalidArgument(_))
        ));
        assert!(matches!(
            attach(&CapabilityDescriptor::vision_sensor(
                "eye",
                1,
                &[SensorMode::SenseColor, SensorMode::SenseDistance]
            )),
            Err(HubError::InvalidArgument(_))
        ));
    }
}
