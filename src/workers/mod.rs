pub mod args;
pub mod peer;
pub mod relay;
