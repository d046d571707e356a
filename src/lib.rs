#[macro_use]
extern crate tracing;

pub mod backend;
pub mod cli;
pub mod handoff;
pub mod input;
pub mod kiosk;
pub mod utils;

#[cfg(test)]
mod testing;
