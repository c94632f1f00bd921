//! rsync CLI wrapper. All byte-level transfer and comparison is delegated to
//! it; yarsync only reasons about its exit codes and itemized output.

pub mod client;
pub mod parser;

pub use client::{FilterSet, RsyncArgs, RsyncClient, RsyncOutput};
pub use parser::*;
