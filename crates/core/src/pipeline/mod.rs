pub mod frame_processor;
pub mod infrastructure;
pub mod rate_controller;
