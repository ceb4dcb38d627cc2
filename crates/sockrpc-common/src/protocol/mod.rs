pub mod error;
pub mod message;


pub use error::{Result, RpcError};
pub use message::{
    ControlMessage, ErrorResponse, InvokeMessage, MessageId, MessageIdGenerator, OkResponse,
    ProtocolMessage, RpcArgs, RpcValue, CONNECTION_OPTION, CONNECT_ACTION, KEEP_ALIVE,
};
