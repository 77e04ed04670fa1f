#![forbid(unsafe_code)]

mod adb;
mod apply;
mod config;
mod probe;
mod sntp;
mod source;
mod sync;
mod tracing;

pub use sync::main as sync_main;
