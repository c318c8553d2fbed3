//! Bluetooth Hands-Free headset emulation: the PC answers and places calls
//! for a paired phone and bridges the call audio to local speakers and
//! microphone.
//!
//! [`session::Session`] ties the pieces together; everything below it is
//! usable on its own and tested against in-memory fakes of the
//! [`link`], [`audio`] and [`bluetooth`] seams.

pub mod aec;
pub mod at;
pub mod audio;
pub mod bluetooth;
pub mod bridge;
pub mod call;
pub mod config;
pub mod contacts;
pub mod control;
pub mod errors;
pub mod link;
pub mod phone;
pub mod ringer;
pub mod sco;
pub mod session;
pub mod slc;
pub mod socket;
pub mod ui;
pub mod worker;
