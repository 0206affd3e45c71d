//! Spawned service processes and their rendezvous.

pub mod connector;
#[allow(clippy::module_inception)]
pub mod controller;

pub use controller::{
    AllocationRequest, Controller, ControllerEvent, ControllerId, ControllerNotification,
    RunOptions,
};
