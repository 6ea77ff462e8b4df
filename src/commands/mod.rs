pub mod chat;
pub mod id;
pub mod serve;
