pub mod emitter;
pub mod relocator;
pub mod writer;

pub use emitter::Arm64Emitter;
