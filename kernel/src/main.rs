//! Kernel binary: on riscv64 the image boots through entry.S -> start()
//! -> kmain() in the library; this file only ties the pieces together.
//! On a host target it is a stub so `cargo build` and `cargo test` work
//! without the cross toolchain.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[allow(unused_extern_crates)]
extern crate kernel;

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("build with --target riscv64gc-unknown-none-elf to get a bootable kernel");
}
