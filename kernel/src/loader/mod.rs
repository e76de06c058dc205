//! Binary loading: Mach-O (and FAT wrappers) into the shared address space.

pub mod macho;

pub use macho::{load, LoadedImage};
