//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod observable;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use observable::ObservableTransport;
pub use traits::{TransportError, UsbTransport};
