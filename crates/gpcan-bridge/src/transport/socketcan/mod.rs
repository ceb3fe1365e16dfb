//! SocketCAN transports (Linux only)

#[cfg(target_os = "linux")]
mod adapter;

#[cfg(target_os = "linux")]
pub use adapter::{SocketCanBus, SocketIsoTpLink};
