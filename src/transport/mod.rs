//! Transport: device framing, byte-stream I/O, and the actor task that
//! owns one open device (the transaction engine lives here too — it is
//! the only code that ever touches a `ServiceRegistry`).

pub mod device;
pub mod frame;
pub mod io;

pub use device::{Device, DeviceHandle, OpenError, TransportMode};
pub use io::Transport;
