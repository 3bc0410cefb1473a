//! This library implements a static devirtualizer for VMProtect-style virtual
//! machines. Given a protected x86/x86-64 executable and the virtual address
//! of a `vmenter`, it recovers a native control-flow graph carrying the
//! original semantics of the protected routine and emits it as an optimized
//! IR module.
//!
//! # How it Works
//!
//! From a very high level, devirtualization is performed as follows:
//!
//! 1. The binary is opened through an [`image::Image`] and mapped into a
//!    concrete/symbolic x86 emulator ([`emu::Emulator`]).
//! 2. The [`tracer::Tracer`] concretely executes the VM interpreter one
//!    handler at a time, symbolizing the virtual instruction pointer, the
//!    virtual stack pointer and the native stack at each handler boundary,
//!    and classifies every handler into a [`vm::VInsn`] by matching the
//!    symbolic expression trees it produces.
//! 3. The [`explorer::Explorer`] drives multi-path discovery: it appends the
//!    classified instructions to [`vm::Routine`] blocks, forks tracer
//!    snapshots at branches, and enumerates branch targets by handing slice
//!    functions to the [`solver`].
//! 4. The [`lifter::Lifter`] translates each block into IR by stitching
//!    together pre-authored handler semantics from the intrinsics module, and
//!    finally assembles and aggressively optimizes the whole routine, with
//!    the segment-aware alias analysis and the store coalescing passes in
//!    [`il::opt`] doing the heavy lifting.
//!
//! # Basic Usage
//!
//! ```no_run
//! use devirt::{explorer::Explorer, il, image::PeImage, lifter::Lifter, tracer::Tracer};
//!
//! # fn main() -> devirt::error::Result<()> {
//! let image = PeImage::open("target.exe")?;
//! let mut lifter = Lifter::from_file("intrinsics/vmprotect.ir")?;
//! let tracer = Tracer::new(image.into_shared());
//!
//! let routine = Explorer::new(tracer).explore(0x1000, &mut lifter)?;
//! let function = lifter.build_final(&routine)?;
//! il::opt::optimize_virtual_function(lifter.module_mut(), function)?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::missing_errors_doc)] // Error conditions live on the error types

pub mod constant;
pub mod emu;
pub mod error;
pub mod explorer;
pub mod il;
pub mod image;
pub mod lifter;
pub mod solver;
pub mod tracer;
pub mod vm;

// Re-exports to provide the library interface.
pub use explorer::Explorer;
pub use lifter::Lifter;
pub use tracer::Tracer;
