pub mod hub_config;
pub mod stream_hub;
