//! Audio sample handling: conversion, framing, transport codec and devices.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod codec;
pub mod device;
pub mod framer;
pub mod pcm;
#[cfg(feature = "cpal-audio")]
pub mod playback;

#[cfg(feature = "cpal-audio")]
pub use cpal_provider::CpalDeviceProvider;

#[cfg(feature = "cpal-audio")]
mod cpal_provider {
    use super::capture::CpalCaptureDevice;
    use super::device::{CaptureDevice, DeviceProvider, PlaybackDevice};
    use super::playback::CpalPlaybackDevice;
    use crate::config::Config;
    use crate::error::Result;

    /// Opens CPAL devices by name, or the preferred defaults.
    #[derive(Debug, Clone, Default)]
    pub struct CpalDeviceProvider {
        input: Option<String>,
        output: Option<String>,
    }

    impl CpalDeviceProvider {
        pub fn new(input: Option<String>, output: Option<String>) -> Self {
            Self { input, output }
        }

        pub fn from_config(config: &Config) -> Self {
            Self::new(config.capture.device.clone(), config.playback.device.clone())
        }
    }

    impl DeviceProvider for CpalDeviceProvider {
        fn open_capture(&self) -> Result<Box<dyn CaptureDevice>> {
            Ok(Box::new(CpalCaptureDevice::new(self.input.clone())))
        }

        fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>> {
            Ok(Box::new(CpalPlaybackDevice::open(self.output.as_deref())?))
        }
    }
}
