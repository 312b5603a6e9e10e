pub mod chat;

pub use chat::{Message, ResponsesRequest, Role, ThreadId};
