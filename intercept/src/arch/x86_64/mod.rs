pub mod emitter;
pub mod relocator;
pub mod writer;

pub use emitter::X86_64Emitter;
