pub mod service;

pub use service::{ChatAnswer, ChatError, ChatService, Paginated, SaveMessagesInput, SavedMessages};
