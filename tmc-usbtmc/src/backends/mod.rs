//! Transport implementations for instruments attached to a Linux host.
pub mod usbtmc;
