pub mod call;
pub mod coerce;
pub mod error;
pub mod remote;
pub mod value;


pub use call::{Call, Reply, SYNC_SEQUENCE};
pub use coerce::{coerce, FromValue, ValueType};
pub use error::{Result, RpcError};
pub use remote::RemoteError;
pub use value::{EnumValue, PojoValue, Value, ANY_COMPONENT};
