//! In-process binary patching for a host executable.
//!
//! Locate code with byte signatures, follow rip-relative references, rewrite
//! bytes with their page protection restored afterwards, and run Rust
//! callbacks in the middle of host functions with full access to the
//! interrupted register state.
//!
//! ```no_run
//! use patching::{Engine, EngineConfig, PatchSet};
//!
//! let engine = Engine::attach(EngineConfig::default())?;
//! let report = engine.apply(PatchSet::new().with("UI Width", |engine| {
//!     let hit = engine.find_pattern("UI Width", "F3 0F 10 05 ?? ?? ?? ?? F3 0F 59 C1")?;
//!     let constant = engine.resolve("UI Width", hit.address, 4)?;
//!     unsafe { patching::patch::write_value(constant, 2560.0f32) }
//! }));
//! assert!(report.is_complete());
//! # Ok::<(), patching::PatchError>(())
//! ```

pub mod asm;
pub mod engine;
pub mod error;
pub mod mem;
pub mod module;
pub mod patch;
pub mod resolve;
pub mod scan;
pub mod signature;

#[cfg(target_arch = "x86_64")]
pub mod context;
#[cfg(target_arch = "x86_64")]
pub mod hooks;

pub use engine::{Engine, EngineConfig, PatchReport, PatchSet};
pub use error::{InstallError, PatchError, Result};
pub use module::ModuleImage;
pub use patch::ElementMarker;
pub use resolve::{RelativeReference, resolve_relative};
pub use scan::{ScanHit, ScanResult, scan_bytes};
pub use signature::ByteSignature;

#[cfg(target_arch = "x86_64")]
pub use context::{RegisterContext, Xmm};
#[cfg(target_arch = "x86_64")]
pub use hooks::{InterceptHandle, Interceptor};
