//! Tether Mach-O image mapper
//!
//! Manually loads a dynamic library image into a task without the OS
//! loader:
//! - Mach-O parsing: segments, dependencies, dyld-info streams, export
//!   trie
//! - Transitive dependency resolution with a shared name table
//! - Rebasing and import binding (weak and resolver-carrying exports
//!   included)
//! - A synthesized per-image runtime area with constructor, destructor
//!   and atexit stub, emitted for the image's architecture
//! - Task memory abstraction covering buffers and Mach task ports

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod emit;
pub mod error;
pub mod macho;
pub mod mapper;
pub mod module;
pub mod task;

pub use error::{MapperError, MapperResult};
pub use mapper::{ExistingImage, ImageSource, Mapper};
pub use module::{BindDetails, CpuType, ExportDetails, Module, RebaseDetails, Segment};
pub use task::{BufferTask, TaskMemory};

#[cfg(target_os = "macos")]
pub use task::MachTask;
