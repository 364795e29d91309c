// Public library interface for imager-engine
//
// Flashes one source image to several raw block devices at once, with
// optional read-back verification. The `imager-writer` binary exposes the
// engine over a JSON-lines channel.

pub mod config;
pub mod disk;
pub mod error;
pub mod flash;
pub mod ipc;
pub mod models;
pub mod pipeline;
pub mod source;
