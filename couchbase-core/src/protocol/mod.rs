//! Memcached binary protocol support.

pub mod codec;
pub mod constants;
pub mod error_map;
pub mod frame;
pub mod opcode;
pub mod status;

pub use codec::FrameCodec;
pub use error_map::{ErrorAttribute, ErrorDefinition, ErrorMap};
pub use frame::{Magic, OperationFrame};
pub use opcode::Opcode;
pub use status::ResponseStatus;
