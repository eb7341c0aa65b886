//! Direct2D/DXGI/Direct3D 11 backend for the backdrop hardware boundary.
//!
//! Everything here is Windows-only; on other targets the crate compiles
//! to nothing so the workspace stays buildable for the portable core.

#[cfg(windows)]
mod backend;

#[cfg(windows)]
pub use backend::D2dBackend;
