pub mod frame_queue;
#[allow(clippy::module_inception)]
pub mod session;
pub mod session_config;
pub mod session_registry;
pub mod stream_error;
