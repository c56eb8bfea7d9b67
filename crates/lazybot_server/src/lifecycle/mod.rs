#![forbid(unsafe_code)]

//! Connection lifecycle: credentials, the transport supervisor, the live
//! channel registry and everything that runs only while connected.

pub mod ads;
pub mod auditor;
pub mod coordinator;
pub mod credentials;
pub mod poller;
pub mod registry;
pub mod single_flight;
pub mod supervisor;
pub mod sync;
pub mod task;

#[cfg(test)]
mod testing;


#[cfg(test)]
mod auditor_tests;


#[cfg(test)]
mod credentials_tests;

#[cfg(test)]
mod poller_tests;

#[cfg(test)]
mod registry_tests;
