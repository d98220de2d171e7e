// ABOUTME: Library crate for skyline exposing the broker, client, supervisor and worker runtime

#![allow(missing_docs)]

pub mod broker;
pub mod client;
pub mod config;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod worker;
