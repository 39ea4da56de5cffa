//! Graph analytics over the transaction and ownership graphs: circular-flow
//! cycle detection, ultimate-beneficial-owner resolution, asset-temporal
//! nexus, Benford digit analysis and structuring bursts.

pub mod benford;
pub mod cycles;
pub mod ubo;

pub use benford::{BenfordReport, DigitAnalytics};
pub use cycles::{CycleDetector, DetectedCycle};
pub use ubo::{OwnershipEngine, UboCandidate};

#[cfg(test)]
mod cycle_tests;
#[cfg(test)]
mod ubo_tests;
