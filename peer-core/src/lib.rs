pub mod drain;
pub mod prelude;
pub mod strng;
pub mod telemetry;
