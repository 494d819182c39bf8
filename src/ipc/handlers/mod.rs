pub mod backup;
pub mod core;
pub mod courses;
pub mod gradebook;
pub mod import;
pub mod sessions;
pub mod setup;
