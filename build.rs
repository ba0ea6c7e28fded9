//! Build script for the weft crate.
//!
//! Registers the migrations directory with Cargo so the `SQLx` `migrate!()`
//! macro picks up schema changes without a clean build.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
