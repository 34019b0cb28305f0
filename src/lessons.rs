//! Lesson behaviors
//!
//! Behavior routines run against a connected hub session. Each lesson
//! declares the capabilities it needs and drives them until done.

use crate::domain::models::{CapabilityDescriptor, Color, HubDescriptor, SensorMode, SensorValue};
use crate::error::HubError;
use crate::infrastructure::bluetooth::{HubControl, HubSession};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub const MOTOR: &str = "motor";
pub const TRAIN_SENSOR: &str = "train_sensor";

const MOTOR_PORT: u8 = 0;
const SENSOR_PORT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lesson {
    /// Accelerate forwards, stop, then run backwards
    ForwardBack,
    /// Run until yellow, reverse, stop on blue
    ColourStop,
}

impl Lesson {
    /// Capabilities a hub must expose for this lesson.
    pub fn descriptor(self) -> HubDescriptor {
        let motor = HubDescriptor::default().with(CapabilityDescriptor::motor(MOTOR, MOTOR_PORT));
        match self {
            Lesson::ForwardBack => motor,
            Lesson::ColourStop => motor.with(CapabilityDescriptor::vision_sensor(
                TRAIN_SENSOR,
                SENSOR_PORT,
                &[SensorMode::SenseColor],
            )),
        }
    }

    /// Run this lesson on a connected session.
    pub async fn run(self, mut session: HubSession) -> Result<(), HubError> {
        match self {
            Lesson::ForwardBack => {
                let lesson = ForwardBack::default();
                session.run(move |hub| lesson.run(hub)).await
            }
            Lesson::ColourStop => {
                let (tx, rx) = mpsc::unbounded_channel();
                session.on_sensor_change(TRAIN_SENSOR, move |value| {
                    if let SensorValue::Color(colour) = value {
                        let _ = tx.send(colour);
                    }
                })?;
                let lesson = ColourStop::default();
                session.run(move |hub| lesson.run(hub, rx)).await
            }
        }
    }
}

/// Lesson 1: ramp up, stop, ramp up in reverse, stop.
#[derive(Debug, Clone)]
pub struct ForwardBack {
    pub top_forwards_speed: i32,
    pub top_backwards_speed: i32,
    pub acceleration: Duration,
    pub deceleration: Duration,
}

impl Default for ForwardBack {
    fn default() -> Self {
        Self {
            top_forwards_speed: 40,
            top_backwards_speed: -40,
            acceleration: Duration::from_secs(2),
            deceleration: Duration::from_millis(500),
        }
    }
}

impl ForwardBack {
    pub async fn run(self, hub: HubControl) -> Result<(), HubError> {
        let motor = hub.motor(MOTOR)?;
        let accel_ms = self.acceleration.as_millis() as i64;
        let decel_ms = self.deceleration.as_millis() as i64;
        info!("{} is running", hub.name());

        // ramps are fire-and-forget, so wait out each one before the next
        motor.ramp_speed(self.top_forwards_speed, accel_ms).await?;
        tokio::time::sleep(self.acceleration).await;

        motor.ramp_speed(0, decel_ms).await?;
        tokio::time::sleep(self.deceleration).await;

        motor.ramp_speed(self.top_backwards_speed, accel_ms).await?;
        tokio::time::sleep(self.acceleration).await;

        motor.ramp_speed(0, decel_ms).await
    }
}

/// Lesson 2: drive forwards, reverse on one colour, stop on another.
#[derive(Debug, Clone)]
pub struct ColourStop {
    pub forwards_speed: i32,
    pub backwards_speed: i32,
    pub reverse_colour: Color,
    pub stop_colour: Color,
}

impl Default for ColourStop {
    fn default() -> Self {
        Self {
            forwards_speed: 20,
            backwards_speed: -10,
            reverse_colour: Color::Yellow,
            stop_colour: Color::Blue,
        }
    }
}

impl ColourStop {
    /// Reacts to every colour in `colours`, in order.
    pub async fn run(
        self,
        hub: HubControl,
        mut colours: mpsc::UnboundedReceiver<Color>,
    ) -> Result<(), HubError> {
        let motor = hub.motor(MOTOR)?;
        info!("{} is running", hub.name());
        motor.set_speed(self.forwards_speed).await?;

        while let Some(colour) = colours.recv().await {
            info!("{} sees {}", hub.name(), colour);
            if colour == self.reverse_colour {
                info!("{} stopping to reverse", hub.name());
                motor.set_speed(0).await?;
                tokio::task::yield_now().await;
                motor.set_speed(self.backwards_speed).await?;
            } else if colour == self.stop_colour {
                motor.set_speed(0).await?;
                info!("{} stopped", hub.name());
                return Ok(());
            }
        }
        Ok(())
    }
}
