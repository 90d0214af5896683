// vim: tw=80
//! Drive copy and sparing for RAID groups
//!
//! Copies a raid-group position onto a spare while the group stays online,
//! rides out brief source outages, and keeps every chunk's needs-rebuild state
//! consistent throughout.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod bitmap;
pub mod config;
pub mod copy;
pub mod cursor;
pub mod edge;
pub mod emeh;
pub mod notify;
pub mod raid_group;
pub mod spare;
pub mod stripe_lock;
pub mod types;

pub use crate::types::*;
