pub mod event_sink;
pub mod frame_decoder;
pub mod inbound;
pub mod outbound;
