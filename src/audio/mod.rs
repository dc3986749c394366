pub mod codec;
pub mod convert;
pub mod device;
pub mod frame;
pub mod vad;

#[cfg(feature = "cpal-audio")]
pub mod capture;
#[cfg(feature = "cpal-audio")]
pub mod output;
