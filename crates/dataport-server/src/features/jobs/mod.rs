//! Jobs feature module
//!
//! Thin control surface over the job queue. Job rows are created elsewhere;
//! these routes submit them, report on them and cancel them.

pub mod routes;

pub use routes::jobs_routes;
