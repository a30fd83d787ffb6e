//! Engine configuration as read from a JSON file.

use crate::calibrate::{BedShape, FaultRegion, MeshConfig};
use crate::error::{BedMeshError, Result};
use crate::mesh::InterpolationAlgorithm;
use crate::probe::{ProbeSettings, SamplesResult};
use crate::transform::{FadeConfig, SplitConfig, MOVE_CHECK_DISTANCE_DEFAULT, SPLIT_DELTA_Z_DEFAULT};
use crate::{Factor, Mm};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    pub samples: usize,
    pub samples_tolerance: Mm,
    pub samples_tolerance_retries: u32,
    pub samples_result: SamplesResult,
    pub sample_retract_dist: Mm,
    /// Defaults to the travel speed.
    pub lift_speed: Option<Mm>,
    pub x_offset: Mm,
    pub y_offset: Mm,
    pub z_offset: Mm,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            samples: 1,
            samples_tolerance: 0.1,
            samples_tolerance_retries: 0,
            samples_result: SamplesResult::Average,
            sample_retract_dist: 2.0,
            lift_speed: None,
            x_offset: 0.0,
            y_offset: 0.0,
            z_offset: 0.0,
        }
    }
}

/// Everything the engine reads at startup. Rectangular beds set
/// `mesh_min`/`mesh_max`; round beds set `mesh_radius` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BedMeshConfig {
    pub probe_count: (usize, usize),
    pub mesh_min: Option<(Mm, Mm)>,
    pub mesh_max: Option<(Mm, Mm)>,
    pub mesh_radius: Option<Mm>,
    pub mesh_origin: (Mm, Mm),
    pub round_probe_count: usize,
    pub mesh_pps: (usize, usize),
    pub algorithm: InterpolationAlgorithm,
    pub bicubic_tension: Factor,
    pub fade_start: Mm,
    pub fade_end: Mm,
    pub fade_target: Option<Mm>,
    pub split_delta_z: Mm,
    pub move_check_distance: Mm,
    pub speed: Mm,
    pub horizontal_move_z: Mm,
    pub relative_reference_index: Option<usize>,
    pub faulty_regions: Vec<FaultRegion>,
    pub probe: ProbeConfig,
}

impl Default for BedMeshConfig {
    fn default() -> Self {
        BedMeshConfig {
            probe_count: (3, 3),
            mesh_min: None,
            mesh_max: None,
            mesh_radius: None,
            mesh_origin: (0.0, 0.0),
            round_probe_count: 5,
            mesh_pps: (2, 2),
            algorithm: InterpolationAlgorithm::Lagrange,
            bicubic_tension: 0.2,
            fade_start: 1.0,
            fade_end: 0.0,
            fade_target: None,
            split_delta_z: SPLIT_DELTA_Z_DEFAULT,
            move_check_distance: MOVE_CHECK_DISTANCE_DEFAULT,
            speed: 50.0,
            horizontal_move_z: 5.0,
            relative_reference_index: None,
            faulty_regions: vec![],
            probe: ProbeConfig::default(),
        }
    }
}

impl BedMeshConfig {
    pub fn from_json(text: &str) -> Result<BedMeshConfig> {
        serde_json::from_str(text).map_err(|e| BedMeshError::Config(format!("Failed to parse config: {e}")))
    }

    /// Validated grid, shape and fault region settings.
    pub fn mesh_config(&self) -> Result<MeshConfig> {
        let (shape, (x_count, y_count)) = match (self.mesh_radius, self.mesh_min, self.mesh_max) {
            (Some(radius), _, _) => {
                if radius <= 0.0 {
                    return Err(BedMeshError::Config(format!("mesh_radius must be positive, got {radius}")));
                }
                let shape = BedShape::Round {
                    radius,
                    origin: self.mesh_origin,
                };
                (shape, (self.round_probe_count, self.round_probe_count))
            }
            (None, Some(min), Some(max)) => {
                if min.0 > max.0 || min.1 > max.1 {
                    return Err(BedMeshError::Config(format!(
                        "mesh_max {max:?} must be greater than mesh_min {min:?}"
                    )));
                }
                (BedShape::Rectangular { min, max }, self.probe_count)
            }
            _ => {
                return Err(BedMeshError::Config(
                    "either mesh_radius or both mesh_min and mesh_max must be specified".into(),
                ))
            }
        };
        Ok(MeshConfig {
            shape,
            x_count,
            y_count,
            mesh_x_pps: self.mesh_pps.0,
            mesh_y_pps: self.mesh_pps.1,
            algo: self.algorithm,
            tension: self.bicubic_tension,
            faulty_regions: self.faulty_regions.clone(),
            relative_reference_index: self.relative_reference_index,
        })
    }

    pub fn fade_config(&self) -> FadeConfig {
        FadeConfig {
            fade_start: self.fade_start,
            fade_end: self.fade_end,
            fade_target: self.fade_target,
        }
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            split_delta_z: self.split_delta_z,
            move_check_distance: self.move_check_distance,
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        let p = &self.probe;
        ProbeSettings {
            samples: p.samples,
            samples_tolerance: p.samples_tolerance,
            samples_tolerance_retries: p.samples_tolerance_retries,
            samples_result: p.samples_result,
            sample_retract_dist: p.sample_retract_dist,
            speed: self.speed,
            lift_speed: p.lift_speed.unwrap_or(self.speed),
            horizontal_move_z: self.horizontal_move_z,
            use_xy_offsets: true,
        }
    }

    pub fn probe_offsets(&self) -> (Mm, Mm, Mm) {
        (self.probe.x_offset, self.probe.y_offset, self.probe.z_offset)
    }
}

pub fn load_config(path: &Path) -> Result<BedMeshConfig> {
    let data = fs::read_to_string(path)
        .map_err(|e| BedMeshError::Config(format!("Failed to read config {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| BedMeshError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_options() {
        let config = BedMeshConfig::from_json(r#"{"mesh_min": [10, 10], "mesh_max": [200, 180]}"#).unwrap();
        assert_eq!(config.probe_count, (3, 3));
        assert_eq!(config.mesh_pps, (2, 2));
        assert_eq!(config.algorithm, InterpolationAlgorithm::Lagrange);
        assert_eq!(config.probe_settings().lift_speed, 50.0);
        let mesh = config.mesh_config().unwrap();
        assert_eq!(
            mesh.shape,
            BedShape::Rectangular {
                min: (10.0, 10.0),
                max: (200.0, 180.0)
            }
        );
    }

    #[test]
    fn full_config_parses() {
        let text = r#"{
            "probe_count": [5, 4],
            "mesh_min": [0, 0],
            "mesh_max": [220, 220],
            "mesh_pps": [3, 3],
            "algorithm": "bicubic",
            "bicubic_tension": 0.3,
            "fade_start": 1.0,
            "fade_end": 10.0,
            "faulty_regions": [{"min": [60, 60], "max": [40, 40]}],
            "probe": {"samples": 3, "samples_result": "median", "x_offset": -25, "z_offset": 1.2}
        }"#;
        let config = BedMeshConfig::from_json(text).unwrap();
        assert_eq!(config.probe.samples_result, SamplesResult::Median);
        assert_eq!(config.probe_offsets(), (-25.0, 0.0, 1.2));
        let mesh = config.mesh_config().unwrap();
        assert_eq!((mesh.x_count, mesh.y_count), (5, 4));
        assert_eq!(mesh.algo, InterpolationAlgorithm::Bicubic);
        assert_eq!(mesh.faulty_regions.len(), 1);
    }

    #[test]
    fn round_bed_uses_round_probe_count() {
        let config = BedMeshConfig::from_json(r#"{"mesh_radius": 90, "round_probe_count": 7}"#).unwrap();
        let mesh = config.mesh_config().unwrap();
        assert_eq!((mesh.x_count, mesh.y_count), (7, 7));
        assert!(matches!(mesh.shape, BedShape::Round { .. }));
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(BedMeshConfig::from_json(r#"{"mesh_min": [0, 0]}"#)
            .unwrap()
            .mesh_config()
            .is_err());
        assert!(BedMeshConfig::from_json(r#"{"mesh_min": [50, 0], "mesh_max": [10, 100]}"#)
            .unwrap()
            .mesh_config()
            .is_err());
        assert!(BedMeshConfig::from_json(r#"{"algorithm": "spline"}"#).is_err());
        assert!(BedMeshConfig::from_json(r#"{"probe_cnt": [3, 3]}"#).is_err());
    }
}
