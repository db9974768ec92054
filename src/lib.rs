//! Jasmine as a library: IR, targets, object emission, register allocation,
//! the x86-64 backend, and the in-memory loader. See `src/bin` for the CLI
//! front end built on top of it.

#![allow(dead_code)]

pub mod common;
pub mod error;
pub mod ir;
pub mod liveness;
pub mod loader;
pub mod object;
pub mod regalloc;
pub mod select;
pub mod target;
pub mod x64;
