//! Core library for the pvscan application.
//!
//! This library automates electrical characterization of photovoltaic device
//! arrays: a motorized XY stage positions substrates, a switch matrix selects
//! one of six devices per substrate, and a source/measure unit runs
//! bidirectional JV sweeps and maximum-power-point tracking. The acquisition
//! sequencer coordinates all of it as a cancellable worker task.
//!
//! Hardware is reached exclusively through the capability traits in
//! [`hardware`], so the whole acquisition path runs unchanged against the
//! mock drivers in [`hardware::mock`].

pub mod addressing;
pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod sequencer;
pub mod sink;
