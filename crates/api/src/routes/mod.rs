pub mod health;
pub mod metrics;
pub mod operations;
pub mod policies;
pub mod sagas;
