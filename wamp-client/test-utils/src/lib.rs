pub mod router;
pub mod setup;
pub mod wait;
