pub mod broker;
pub mod config;
pub mod device;
pub mod engines;
pub mod gateway;
pub mod mailbox;
pub mod pacing;
pub mod reassembly;
