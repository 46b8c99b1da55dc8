//! Price engine building blocks

pub mod align;
pub mod cache;
pub mod clock;
pub mod config;
pub mod derive;
pub mod engine;
pub mod fallback;
pub mod log;
pub mod quote;
pub mod source;

// Re-export main types for cleaner imports
pub use engine::{FxBoard, MetalBoard, PriceEngine, Reading, Snapshot};
pub use quote::{FetchKind, FetchRequest, Fetched, Quantity, Quote, Series, SourceId};
pub use source::{AllSourcesFailed, FetchError, SourceClient};
