pub mod client;
pub mod error;
pub mod types;

pub use client::AnthropicClient;
pub use error::AnthropicError;
pub use types::{ContentPart, Message, MessagesRequest, MessagesResponse};

/// Sends a Messages API request. Implemented by [`AnthropicClient`] and by
/// test doubles.
#[allow(async_fn_in_trait)]
pub trait MessageSender {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError>;
}
