//! Actuator capability: a hobby servo plus an amplifier power pin.

use crate::error::ChatterError;

/// Pulse width in µs for a servo angle in degrees.
pub fn angle_to_pulse_us(angle: f32) -> u32 {
    let angle = if angle.is_finite() { angle.clamp(0.0, 180.0) } else { 0.0 };
    (500.0 + 2000.0 * angle / 180.0).round() as u32
}

/// Writes to the mouth hardware. Only the servo worker thread calls these.
pub trait ActuatorDriver: Send {
    /// Drive the servo to `angle` degrees.
    fn set_angle(&mut self, angle: f32) -> Result<(), ChatterError>;

    /// Stop sending pulses so the servo goes limp.
    fn release(&mut self) -> Result<(), ChatterError>;

    /// Switch the amplifier/servo power pin.
    fn set_power(&mut self, on: bool) -> Result<(), ChatterError>;
}

/// Driver for boxes without a servo.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullActuator;

impl ActuatorDriver for NullActuator {
    fn set_angle(&mut self, _angle: f32) -> Result<(), ChatterError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), ChatterError> {
        Ok(())
    }

    fn set_power(&mut self, _on: bool) -> Result<(), ChatterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_width_mapping() {
        assert_eq!(angle_to_pulse_us(0.0), 500);
        assert_eq!(angle_to_pulse_us(90.0), 1500);
        assert_eq!(angle_to_pulse_us(180.0), 2500);
        assert_eq!(angle_to_pulse_us(270.0), 2500);
        assert_eq!(angle_to_pulse_us(-10.0), 500);
        assert_eq!(angle_to_pulse_us(f32::NAN), 500);
    }
}
