#![forbid(unsafe_code)]

//! Shared building blocks for the tubegate HTTP gateway.
//!
//! The gateway binary only wires these together: `ytdlp` talks to the
//! external tool, `formats` turns its metadata into download options and
//! `relay` pipes media bytes into a response body.

pub mod config;
pub mod error;
pub mod formats;
pub mod relay;
pub mod ytdlp;
