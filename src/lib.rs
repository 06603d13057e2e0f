pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod persona;
pub mod playback;
pub mod session;
pub mod transport;
