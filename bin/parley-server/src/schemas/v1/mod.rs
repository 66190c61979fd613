pub mod audio;
pub mod chat;
pub mod models;
