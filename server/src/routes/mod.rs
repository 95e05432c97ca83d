pub mod api;
pub mod cells;
pub mod sse;
