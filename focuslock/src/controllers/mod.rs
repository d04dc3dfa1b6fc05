//! Feedback control laws for the focus lock

mod pi_controller;

pub use pi_controller::{PiController, PiGains, PiOutput};
