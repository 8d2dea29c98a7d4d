pub mod guest_quota;
pub mod token_verifier;
