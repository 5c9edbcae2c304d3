pub mod chat;
pub mod events;
pub mod providers;
pub mod roster;
pub mod storage;
pub mod threads;
