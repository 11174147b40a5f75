//! # Rotor RPM Library
//!
//! Motor RPM acquisition for a flight controller's governor and protections.
//!
//! This library decodes serial ESC telemetry (KISS polled frames and the
//! Hobbywing V4 stream), picks one eRPM origin per motor and turns it into
//! filtered mechanical RPM.

pub mod config;
pub mod error;
pub mod esc;
pub mod rpm;
pub mod telemetry;
pub mod transport;
