//! Retained GPU-backed presentation pipeline.
//!
//! The pipeline per frame: [`store::BackingStore::begin_paint`] clears
//! the dirty region on the window's paint bitmap, the client draws
//! through the bitmap's [`scope::DrawScope`], `end_paint` closes the
//! scope, `flush` composites the painted region into the window's back
//! buffer and presents (swap-chain present or layered/blit update).
//!
//! Everything GPU-facing goes through the `backdrop-hal` traits; the
//! Direct2D backend lives in `backdrop-d2d`.

pub mod bitmap;
pub mod device;
pub mod region;
pub mod scope;
pub mod store;
pub mod window;

pub use backdrop_hal as hal;

pub use backdrop_hal::Color;
pub use bitmap::Bitmap;
pub use device::{global, init_global, GraphicsDevice};
pub use region::DirtyRegion;
pub use scope::{DrawScope, EndDrawOutcome};
pub use store::{create_backing_store, BackingStore, BlitBackingStore, SwapChainBackingStore};
pub use window::{PaintWindow, WindowTarget};
