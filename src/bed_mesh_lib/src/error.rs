use crate::Mm;
use thiserror::Error;

/// Failure reported by a measurement device while taking one sample.
///
/// Timeouts belong to the device, so a timed out measurement arrives here as
/// an ordinary sample error and goes through the same propagation as any
/// other device fault.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("probe triggered prior to movement")]
    TriggeredEarly,
    #[error("no trigger after full movement")]
    NoTrigger,
    #[error("probe measurement timed out")]
    Timeout,
    #[error("probe error: {0}")]
    Device(String),
}

/// Failure reported by the external motion system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("move out of range: ({x:.3}, {y:.3}, {z:.3})")]
    OutOfRange { x: Mm, y: Mm, z: Mm },
    #[error("motion error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum BedMeshError {
    #[error("bed_mesh: {0}")]
    Config(String),

    #[error("Probe samples exceed samples_tolerance (spread {spread:.6} > {tolerance:.6} after {retries} retries)")]
    ToleranceExceeded {
        spread: Mm,
        tolerance: Mm,
        retries: u32,
    },

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error("bed_mesh: {message}: expected {expected}, got {actual}")]
    ShapeMismatch {
        message: String,
        expected: usize,
        actual: usize,
    },

    #[error(
        "bed_mesh: point mismatch, orig = ({:.2}, {:.2}), probed = ({:.2}, {:.2})",
        .generated.0,
        .generated.1,
        .probed.0,
        .probed.1
    )]
    PointMismatch {
        generated: (Mm, Mm),
        probed: (Mm, Mm),
    },

    #[error("bed_mesh: Slice distance is negative or greater than entire move length (t = {t})")]
    SplitRange { t: Mm },

    #[error("bed_mesh: {0}")]
    FadeRange(String),

    #[error("bed_mesh: bed has not been probed")]
    NoMesh,

    #[error("bed_mesh: Unknown profile [{0}]")]
    UnknownProfile(String),

    #[error("Profile '{0}' is reserved, please choose another profile name.")]
    ReservedProfileName(String),

    #[error("bed_mesh: a probe session is already in progress")]
    ProbeBusy,

    #[error("bed_mesh: probe session aborted")]
    ProbeAborted,

    #[error("unable to parse '{input}': {message}")]
    Parse { input: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BedMeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_mismatch_reports_both_points() {
        let err = BedMeshError::PointMismatch {
            generated: (10.0, 20.0),
            probed: (10.5, 20.0),
        };
        assert_eq!(
            err.to_string(),
            "bed_mesh: point mismatch, orig = (10.00, 20.00), probed = (10.50, 20.00)"
        );
    }

    #[test]
    fn sample_error_converts() {
        let err: BedMeshError = SampleError::Timeout.into();
        assert!(matches!(err, BedMeshError::Sample(SampleError::Timeout)));
        assert_eq!(err.to_string(), "probe measurement timed out");
    }
}
