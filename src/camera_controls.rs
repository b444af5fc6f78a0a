//! Camera gain control
//!
//! Gain is the one hardware control the operator can adjust. The range is
//! queried once from the device; every write is bounds-checked against it
//! before it reaches the hardware.

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};
use v4l::control::{Control, Flags, Value};
use v4l::Device;

/// V4L2_CID_GAIN
pub const V4L2_CID_GAIN: u32 = 0x00980913;
/// V4L2_CID_ANALOGUE_GAIN, used by sensors that do not expose a plain gain control
pub const V4L2_CID_ANALOGUE_GAIN: u32 = 0x009e0903;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GainError {
    #[error("gain {value} outside of [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
    #[error("camera has no gain control")]
    Unsupported,
    #[error("gain control failed: {0}")]
    Device(String),
}

/// Gain adjustment as exposed by the acquisition adapter
pub trait GainControl {
    /// Inclusive (min, max) range reported by the camera
    fn gain_range(&self) -> (i64, i64);
    fn set_gain(&mut self, value: i64) -> Result<(), GainError>;
    fn gain(&self) -> Result<i64, GainError>;
}

/// Reject values outside the inclusive range
pub fn check_range(value: i64, (min, max): (i64, i64)) -> Result<(), GainError> {
    if value < min || value > max {
        return Err(GainError::OutOfRange { value, min, max });
    }
    Ok(())
}

/// Description of the device's gain control
#[derive(Debug, Clone)]
pub struct GainDescriptor {
    pub id: u32,
    pub name: String,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
}

/// Gain control backed by a V4L2 device node
pub struct V4lGain {
    device_path: String,
    descriptor: Option<GainDescriptor>,
}

impl V4lGain {
    /// Query the device for a usable gain control
    pub fn discover(device_path: &str) -> Result<Self> {
        let device = Device::with_path(device_path)
            .with_context(|| format!("Failed to open device: {}", device_path))?;

        let descriptions = device
            .query_controls()
            .with_context(|| "Failed to query camera controls")?;

        let descriptor = [V4L2_CID_GAIN, V4L2_CID_ANALOGUE_GAIN]
            .iter()
            .find_map(|id| {
                descriptions.iter().find(|d| {
                    d.id == *id
                        && !d.flags.contains(Flags::DISABLED)
                        && !d.flags.contains(Flags::READ_ONLY)
                })
            })
            .map(|d| GainDescriptor {
                id: d.id,
                name: d.name.clone(),
                minimum: d.minimum,
                maximum: d.maximum,
                step: d.step,
            });

        match &descriptor {
            Some(d) => info!(
                "Gain control '{}' (id={:#x}) range [{}, {}] step {}",
                d.name, d.id, d.minimum, d.maximum, d.step
            ),
            None => info!("No gain control on {}", device_path),
        }

        Ok(Self {
            device_path: device_path.to_string(),
            descriptor,
        })
    }

    /// Gain control that reports no range and rejects writes
    pub fn unsupported(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            descriptor: None,
        }
    }

    fn open(&self) -> Result<Device, GainError> {
        Device::with_path(&self.device_path).map_err(|e| GainError::Device(e.to_string()))
    }
}

impl GainControl for V4lGain {
    fn gain_range(&self) -> (i64, i64) {
        self.descriptor
            .as_ref()
            .map(|d| (d.minimum, d.maximum))
            .unwrap_or((0, 0))
    }

    fn set_gain(&mut self, value: i64) -> Result<(), GainError> {
        let id = self.descriptor.as_ref().ok_or(GainError::Unsupported)?.id;
        check_range(value, self.gain_range())?;

        let device = self.open()?;
        device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|e| GainError::Device(e.to_string()))?;

        debug!("Set gain (id={:#x}) to {}", id, value);
        Ok(())
    }

    fn gain(&self) -> Result<i64, GainError> {
        let id = self.descriptor.as_ref().ok_or(GainError::Unsupported)?.id;
        let device = self.open()?;
        let ctrl = device
            .control(id)
            .map_err(|e| GainError::Device(e.to_string()))?;

        match ctrl.value {
            Value::Integer(v) => Ok(v),
            Value::Boolean(b) => Ok(b as i64),
            other => Err(GainError::Device(format!("unexpected gain value {:?}", other))),
        }
    }
}
