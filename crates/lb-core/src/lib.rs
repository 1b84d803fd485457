pub mod error;
pub mod gc;
pub mod value;

pub use error::BridgeError;
pub use gc::GcOperation;
pub use value::HostValue;
