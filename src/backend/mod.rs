//! Display output without a windowing system.
//!
//! - `kms` - the DRM card: master, topology and modes
//! - `present` - getting rendered buffers on screen

pub mod kms;
pub mod present;
