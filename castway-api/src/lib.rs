//! HTTP boundary for the Castway SFU
//!
//! WHIP publish, WHEP playback with the layer discovery and layer switch
//! extensions, and a status listing of live streams.

pub mod http;

pub use http::{create_router, AppError, AppResult, AppState};
