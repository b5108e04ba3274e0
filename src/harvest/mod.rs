//! Harvest module - upstream access, format parsing and orchestration.
//!
//! This module provides the core of the package harvester:
//! - **Traits**: [`SourceAdapter`], [`PackageFormat`] as the seams per ecosystem
//! - **Formats**: Nix expressions, PKGBUILDs and Flatpak manifests
//! - **Sources**: Flathub, nixpkgs and AUR adapters over a resilient HTTP client
//! - **Pipeline**: The run orchestrator via [`pipeline::HarvestPipeline`]

pub mod formats;
pub mod pipeline;
pub mod sources;
pub mod traits;

// Re-export commonly used types
pub use traits::{FormatError, FormatExtract, PackageFormat, Page, SourceAdapter, SourceError};

pub use pipeline::{HarvestPipeline, HarvestReport, PipelineError, RunPhase, SourceReport};
