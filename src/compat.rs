//! Structural compatibility between a clone's source and target claims

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";

/// Decides whether a source claim may be cloned into a target claim
pub trait CompatibilityChecker: Send + Sync {
    fn check(&self, source: &PersistentVolumeClaimSpec, target: &PersistentVolumeClaimSpec)
        -> Result<()>;
}

/// Host-assisted copy rules: the target must be at least as large as the
/// source, use the same volume mode, and declare an access mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecCompatibility;

impl CompatibilityChecker for SpecCompatibility {
    fn check(
        &self,
        source: &PersistentVolumeClaimSpec,
        target: &PersistentVolumeClaimSpec,
    ) -> Result<()> {
        let source_request = requested_storage(source)?;
        let target_request = requested_storage(target)?;
        if source_request > target_request {
            return Err(Error::incompatible(
                "target resources requests storage size is smaller than the source",
            ));
        }

        if volume_mode(source) != volume_mode(target) {
            return Err(Error::incompatible(
                "source volumeMode and target volumeMode do not match",
            ));
        }

        if target.access_modes.as_ref().map_or(true, Vec::is_empty) {
            return Err(Error::incompatible("target PVC does not declare an access mode"));
        }

        Ok(())
    }
}

/// Volume mode with the API default applied
pub fn volume_mode(spec: &PersistentVolumeClaimSpec) -> &str {
    spec.volume_mode.as_deref().unwrap_or(VOLUME_MODE_FILESYSTEM)
}

/// Requested storage in bytes; a claim without a request counts as zero
fn requested_storage(spec: &PersistentVolumeClaimSpec) -> Result<f64> {
    match spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
    {
        Some(quantity) => parse_quantity(quantity),
        None => Ok(0.0),
    }
}

/// Parse a Kubernetes resource quantity ("10Gi", "500M", "1.5e3") into a
/// plain number of base units.
pub fn parse_quantity(quantity: &Quantity) -> Result<f64> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let invalid = || Error::incompatible(format!("invalid storage quantity {:?}", raw));
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..].parse().map_err(|_| invalid())?;
            10f64.powi(power)
        }
        _ => return Err(invalid()),
    };

    Ok(value * multiplier)
}
