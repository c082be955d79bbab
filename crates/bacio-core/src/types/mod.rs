/// Borrowed bit string type.
pub mod bit_string;
/// Zero-copy application-layer data values.
pub mod data_value;
/// BACnet date and time types.
pub mod date_time;
/// Packed object identifier (type + instance).
pub mod object_id;
/// BACnet object type enumeration.
pub mod object_type;
/// Protocol-level enumerations (segmentation, max APDU, error/reject/abort reasons).
pub mod protocol;
/// BACnet property identifier enumeration.
pub mod property_id;

pub use bit_string::BitString;
pub use data_value::DataValue;
pub use date_time::{Date, Time};
pub use object_id::ObjectId;
pub use object_type::ObjectType;
pub use property_id::PropertyId;
pub use protocol::{AbortReason, ErrorClass, ErrorCode, MaxApdu, RejectReason, Segmentation};
