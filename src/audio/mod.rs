//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod circular;
pub mod device;
pub mod playback;
pub mod virtual_device;

pub use backend::{AudioBackend, CaptureDevice, PlaybackDevice, VoiceFormat};
pub use buffer::RingBuffer;
pub use capture::RecordReconciler;
pub use circular::CircularBuffer;
pub use device::{list_devices, AudioDeviceInfo, CpalBackend};
pub use playback::{PlaybackReconciler, UnderrunPolicy};
pub use virtual_device::VirtualBackend;
