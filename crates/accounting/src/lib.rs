//! Privacy accounting for differentially private training.
//!
//! An [`Accountant`] tracks the noise multiplier, sample rate and completed
//! steps of a DP-SGD run, answers epsilon-at-delta queries, and searches for
//! the noise multiplier that meets a target budget.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountant;
pub mod calibrate;
pub mod gdp;
pub mod params;
pub mod rdp;

pub use accountant::{Accountant, AccountantKind, AnyAccountant};
pub use calibrate::{calibrate_noise_multiplier, CalibrationOptions};
pub use gdp::GdpAccountant;
pub use params::{planned_steps, sample_rate, PrivacyBudget};
pub use rdp::{default_orders, RdpAccountant};

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        calibrate_noise_multiplier, planned_steps, sample_rate, Accountant, AccountantKind,
        AnyAccountant, CalibrationOptions, GdpAccountant, PrivacyBudget, RdpAccountant,
    };
}
