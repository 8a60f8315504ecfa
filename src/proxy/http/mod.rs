mod headers;
mod message;

pub use headers::{HeaderMatch, HeaderTable};
pub use message::{Body, Message, ReadLimits, read_message};
