//! Chunk streaming and clustering engine for a large sparse claim grid.
//!
//! The [`engine::Engine`] owns every piece of mutable state and is driven by
//! a single task; fetch workers, live updates and timers report back to it
//! through channels.

pub mod cell_store;
pub mod chunks;
pub mod cluster;
pub mod compositor;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod http;
pub mod label_layout;
pub mod live;
pub mod raster;
pub mod render_loop;
pub mod selection;
pub mod viewport;

pub use engine::{Engine, EngineCommand, EngineHandle, EngineStats};
pub use error::{ClusterError, FetchError, RasterError};
