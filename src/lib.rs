#![forbid(unsafe_code)]

// Media node library - worker pool, resource registries and the control protocol served to room servers

pub mod config;
pub mod engine;
pub mod handlers;
pub mod load;
pub mod media;
pub mod node;
pub mod room_server;
pub mod signaling;

#[cfg(test)]
mod testing;
