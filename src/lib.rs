//! exFAT filesystem driver, built to run as a single task of a small
//! message-driven operating system. The task owns one mounted volume and
//! serves open/read/write/seek/remove/mkdir requests over a typed
//! request/response boundary (`service`).

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod filesys;
pub mod logging;
pub mod service;
