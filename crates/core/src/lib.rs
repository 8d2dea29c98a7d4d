pub mod auth;
pub mod detection;
pub mod hub;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod shared;
pub mod tracking;
