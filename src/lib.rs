//! SOCKS tunnels through an SSH jump host, process management on the jump
//! host, and an SSH-driven Gatling simulation runner.

pub mod config;
pub mod gatling;
pub mod ssh;
