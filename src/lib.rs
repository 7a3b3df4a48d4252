pub mod auth;
pub mod chat;
pub mod config;
pub mod data;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod provider;

use crate::chat::ChatService;
use crate::data::DataService;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub data: DataService,
    pub chat: ChatService,
}
