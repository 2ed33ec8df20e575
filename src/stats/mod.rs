//! Trip and route statistics over a loaded feed.
//!
//! Statistics are recomputed for every request; no result is cached between dates.

pub mod analysis;
pub mod route_stats;
pub mod trip_stats;

pub use analysis::DailyStats;
pub use route_stats::{HeadwayWindow, RouteStats, compute_route_stats};
pub use trip_stats::{TripStats, compute_trip_stats, compute_trip_stats_on};
