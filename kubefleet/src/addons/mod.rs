//! Everything installed into member clusters after bring-up: bundled
//! charts, components, typed secrets and user releases.

mod charts;
pub mod components;
mod installer;
pub mod releases;
pub mod secrets;

pub use installer::AddonInstaller;
