// Level-of-detail decimation for render-width-bounded series output
//
// Architecture:
// - `stride`: the pure reduction algorithm (stride sampling with forced
//   edge inclusion)
// - `engine`: token-addressed message protocol served by a dedicated
//   compute thread, with a sticky synchronous fallback behind the same
//   interface when the thread cannot be created

pub mod engine;
pub mod stride;

pub use engine::{
    DecimationBackend, DecimationEngine, DecimatedSeries, EnginePayload, EngineRequest,
    EngineResponse,
};
pub use stride::{point_budget, stride_decimate};
