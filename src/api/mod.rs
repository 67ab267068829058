pub mod latency;
pub mod routes;

pub use latency::LatencyStats;
pub use routes::{router, ApiState};
