mod handler;
pub(crate) mod model;

pub use handler::{delete_message, get_messages, post_message};
pub use model::{DeleteMessageResponse, PostMessageRequest};
