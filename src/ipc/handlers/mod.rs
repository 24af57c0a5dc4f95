pub mod activities;
pub mod attendance;
pub mod catalog;
pub mod core;
pub mod registrations;
pub mod scores;
