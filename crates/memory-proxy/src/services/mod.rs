pub mod conversation;
pub mod passthrough;
pub mod relay;
pub mod upstream;

pub use conversation::{ConversationAssembler, PreparedConversation};
pub use passthrough::PassthroughProxy;
pub use relay::{RelayMode, ResponseRelay};
pub use upstream::UpstreamClient;
