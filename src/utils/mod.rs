pub mod atomic_write;
pub mod sanitize;
pub mod sos;
