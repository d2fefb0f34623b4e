#![forbid(unsafe_code)]

pub mod auth;
pub mod broker;
pub mod connection;
pub mod directory;
pub mod guard;
pub mod registry;
pub mod router;
pub mod sessions;

#[cfg(test)]
mod broker_tests;




#[cfg(test)]
mod router_tests;
