//! sv6: a teaching kernel core for RISC-V (Sv39), written in Rust.
//!
//! The crate builds as a staticlib that is linked against `kernel.ld` for
//! qemu's `virt` machine. On any other target the `hosted` architecture
//! back end is selected instead, which is just enough to compile the kernel
//! and to run the subsystem unit tests on the host.

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny lints that bite kernel code in practice.
#![deny(absolute_paths_not_starting_with_crate)]
#![warn(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_import_braces)]
#![allow(dead_code)]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod arch;
pub mod bio;
pub mod console;
pub mod cpu;
pub mod kalloc;
pub mod kernel;
pub mod lock;
pub mod memlayout;
pub mod page;
pub mod param;
pub mod plic;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod uart;
pub mod virtio;
pub mod vm;

pub use kernel::kernel_main;
