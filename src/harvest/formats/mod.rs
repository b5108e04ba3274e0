//! Package format implementations.
//!
//! Each module implements the [`PackageFormat`](crate::harvest::PackageFormat)
//! trait for one upstream text format:
//! - `nix` - Nix package expressions (nixpkgs)
//! - `pkgbuild` - Arch `PKGBUILD` recipes (AUR)
//! - `manifest` - Flatpak build manifests (Flathub)

pub mod manifest;
pub mod nix;
pub mod pkgbuild;

pub use manifest::{package_name_from_app_id, FlatpakManifest, ManifestFormat};
pub use nix::{NixExpression, NixFormat, NixNode, NixPackage, ParseQuality};
pub use pkgbuild::{PkgbuildFormat, PkgbuildPackage, Recipe, RecipeValue};

use crate::harvest::traits::PackageFormat;
use std::path::Path;

/// Returns the first known format that claims `path`.
pub fn detect(path: &Path) -> Option<Box<dyn PackageFormat>> {
    let formats: [Box<dyn PackageFormat>; 3] = [
        Box::new(NixFormat),
        Box::new(PkgbuildFormat),
        Box::new(ManifestFormat),
    ];
    formats.into_iter().find(|format| format.can_handle(path))
}
