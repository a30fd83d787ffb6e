pub mod calibrate;
pub mod config;
pub mod configfile;
pub mod error;
pub mod gcode;
pub mod mesh;
pub mod probe;
pub mod profile;
pub mod sim;
pub mod transform;

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::ops;
use std::rc::Rc;

pub use calibrate::{BedShape, FaultRegion, MeshCalibrator, MeshConfig};
pub use config::BedMeshConfig;
pub use configfile::ConfigFile;
pub use error::{BedMeshError, MotionError, Result, SampleError};
pub use gcode::ExtendedCommand;
pub use mesh::{InterpolationAlgorithm, MeshParams, ProbedMatrix, ZMesh};
pub use probe::{ManualStep, Probe, ProbeOrchestrator, ProbePoint, ProbeSettings, SamplesResult};
pub use profile::{Profile, ProfileStore, DEFAULT_PROFILE};
pub use transform::{FadeConfig, MeshTransform, SplitConfig};

// Type aliases rather than newtypes; the arithmetic reads better and the
// numeric type can be switched in one place.
pub type Mm = f64;
pub type Factor = f64;

/// Toolhead position, including the extruder axis.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
    pub e: Mm,
}

impl Coord {
    pub fn new(x: Mm, y: Mm, z: Mm, e: Mm) -> Coord {
        Coord { x, y, z, e }
    }

    /// Length of the XYZ part, ignoring the extruder.
    pub fn norm_xyz(&self) -> Mm {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl ops::Sub<Coord> for Coord {
    type Output = Coord;

    fn sub(self, rhs: Coord) -> Coord {
        Coord { x: self.x - rhs.x, y: self.y - rhs.y, z: self.z - rhs.z, e: self.e - rhs.e }
    }
}

/// The motion system the engine drives. Implementations own the planner and
/// the machine; the engine only queues moves and reads positions back.
pub trait Toolhead {
    /// Unmeshed move of the given axes; `None` leaves an axis where it is.
    fn move_to(
        &mut self,
        x: Option<Mm>,
        y: Option<Mm>,
        z: Option<Mm>,
        speed: Mm,
    ) -> std::result::Result<(), MotionError>;

    /// Full four axis move, already corrected by the mesh.
    fn queue_move(&mut self, pos: Coord, speed: Mm) -> std::result::Result<(), MotionError>;

    fn get_position(&self) -> Coord;

    fn wait_until_idle(&mut self) -> std::result::Result<(), MotionError> {
        Ok(())
    }
}

/// Snapshot of the engine, shaped for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BedMeshStatus {
    pub profile_name: String,
    pub mesh_min: (Mm, Mm),
    pub mesh_max: (Mm, Mm),
    pub probed_matrix: ProbedMatrix,
    pub mesh_matrix: Vec<Vec<Mm>>,
    pub profiles: BTreeMap<String, Profile>,
}

/// The engine: active mesh, calibration, profiles and the command surface.
#[derive(Debug)]
pub struct BedMesh {
    transform: MeshTransform,
    orchestrator: ProbeOrchestrator,
    calibrator: MeshCalibrator,
    profiles: ProfileStore,
    probe_offsets: (Mm, Mm, Mm),
    horizontal_move_z: Mm,
    profile_name: Option<String>,
    manual_profile: Option<String>,
}

impl BedMesh {
    /// Builds the engine from its configuration and the persisted profile
    /// sections, loading the `default` profile when one exists.
    pub fn new(config: &BedMeshConfig, persisted: &ConfigFile) -> Result<BedMesh> {
        let mut bed_mesh = BedMesh {
            transform: MeshTransform::new(&config.fade_config(), config.split_config())?,
            orchestrator: ProbeOrchestrator::new(config.probe_settings()),
            calibrator: MeshCalibrator::new(config.mesh_config()?)?,
            profiles: ProfileStore::from_config(persisted)?,
            probe_offsets: config.probe_offsets(),
            horizontal_move_z: config.horizontal_move_z,
            profile_name: None,
            manual_profile: None,
        };
        if bed_mesh.profiles.contains(DEFAULT_PROFILE) {
            bed_mesh.load_profile(DEFAULT_PROFILE)?;
        }
        Ok(bed_mesh)
    }

    pub fn mesh(&self) -> Option<&Rc<ZMesh>> {
        self.transform.mesh()
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.profile_name.as_deref()
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn calibrator(&self) -> &MeshCalibrator {
        &self.calibrator
    }

    pub fn transform(&self) -> &MeshTransform {
        &self.transform
    }

    /// Probes the configured points, builds a mesh from them, makes it the
    /// active mesh and stores it under `profile` (`default` if unnamed).
    /// Any failure leaves the active mesh and stored profiles as they were.
    pub fn calibrate(
        &mut self,
        profile: Option<&str>,
        probe: &mut dyn Probe,
        toolhead: &mut dyn Toolhead,
    ) -> Result<()> {
        let name = profile.unwrap_or(DEFAULT_PROFILE).to_owned();
        self.check_probe_offsets(probe)?;
        toolhead.wait_until_idle()?;
        // Probing moves the toolhead behind the transform's back, whether or
        // not it succeeds.
        self.transform.reset_position();
        let path = self.calibrator.probe_path();
        log::info!("bed_mesh: probing {} points for profile '{name}'", path.len());
        let positions = self.orchestrator.visit(&path, probe, toolhead)?;
        let mesh = self.calibrator.finalize(self.probe_offsets, &positions, &name)?;
        self.install(mesh, &name)
    }

    /// Single multi-sample probe at the current toolhead position.
    pub fn probe_here(&mut self, probe: &mut dyn Probe, toolhead: &mut dyn Toolhead) -> Result<ProbePoint> {
        self.transform.reset_position();
        self.orchestrator.run_probe(probe, toolhead)
    }

    // Point generation and the PGP report use the configured offsets; a
    // device reporting different ones would shift every probed point.
    fn check_probe_offsets(&self, probe: &dyn Probe) -> Result<()> {
        let (x, y, z) = probe.offsets();
        let (cx, cy, cz) = self.probe_offsets;
        let tol = 1e-9;
        if (x - cx).abs() > tol || (y - cy).abs() > tol || (z - cz).abs() > tol {
            return Err(BedMeshError::Config(format!(
                "probe reports offsets ({x}, {y}, {z}) but ({cx}, {cy}, {cz}) are configured"
            )));
        }
        Ok(())
    }

    /// Opens an operator driven calibration. Drive it with `manual_advance`
    /// and `manual_confirm`.
    pub fn start_manual_calibration(&mut self, profile: Option<&str>) -> Result<()> {
        self.orchestrator.start_manual(self.calibrator.probe_path())?;
        self.transform.reset_position();
        self.manual_profile = Some(profile.unwrap_or(DEFAULT_PROFILE).to_owned());
        Ok(())
    }

    /// Parks over the next point, or finishes the calibration once every
    /// point is confirmed.
    pub fn manual_advance(&mut self, toolhead: &mut dyn Toolhead) -> Result<ManualStep> {
        self.transform.reset_position();
        let step = self.orchestrator.advance(toolhead)?;
        if let ManualStep::Done(positions) = &step {
            let name = self
                .manual_profile
                .take()
                .unwrap_or_else(|| DEFAULT_PROFILE.to_owned());
            // The nozzle itself is the probe.
            let mesh = self.calibrator.finalize((0.0, 0.0, 0.0), positions, &name)?;
            self.install(mesh, &name)?;
        }
        Ok(step)
    }

    pub fn manual_confirm(&mut self, toolhead: &dyn Toolhead) -> Result<()> {
        self.orchestrator.confirm(toolhead)
    }

    pub fn manual_abort(&mut self) {
        self.orchestrator.abort();
        self.transform.reset_position();
        self.manual_profile = None;
    }

    fn install(&mut self, mesh: ZMesh, name: &str) -> Result<()> {
        self.transform.set_mesh(Some(mesh))?;
        if let Some(mesh) = self.transform.mesh() {
            self.profiles.save(name, mesh);
        }
        self.profile_name = Some(name.to_owned());
        log::info!("bed_mesh: mesh '{name}' is active");
        Ok(())
    }

    /// Human readable mesh report, or the generated probe points with `pgp`.
    pub fn output(&self, pgp: bool) -> String {
        if pgp {
            return self
                .calibrator
                .generated_points_report((self.probe_offsets.0, self.probe_offsets.1));
        }
        match self.transform.mesh() {
            None => "Bed has not been probed".to_owned(),
            Some(mesh) => {
                let mut msg = mesh.probed_matrix_report();
                msg.push_str(&mesh.mesh_report(Some(self.horizontal_move_z)));
                msg
            }
        }
    }

    /// The active mesh's probed heights as JSON, prefixed for front-ends
    /// that scan output for it.
    pub fn map(&self) -> Result<String> {
        let mesh = self.transform.mesh().ok_or(BedMeshError::NoMesh)?;
        let params = mesh.params();
        let out = json!({
            "mesh_min": [params.min_x, params.min_y],
            "mesh_max": [params.max_x, params.max_y],
            "z_positions": mesh.probed_matrix(),
        });
        Ok(format!("mesh_map_output {out}"))
    }

    pub fn clear(&mut self) {
        self.transform.clear();
        self.profile_name = None;
    }

    pub fn offset(&mut self, x: Option<Mm>, y: Option<Mm>) -> Result<()> {
        self.transform.set_offsets(x, y)
    }

    /// Stores the active mesh under an operator chosen name.
    pub fn save_profile(&mut self, name: &str) -> Result<()> {
        let mesh = self.transform.mesh().ok_or(BedMeshError::NoMesh)?;
        self.profiles.save_interactive(name, mesh)?;
        self.profile_name = Some(name.to_owned());
        Ok(())
    }

    pub fn load_profile(&mut self, name: &str) -> Result<()> {
        let mesh = self.profiles.load(name)?;
        self.transform.set_mesh(Some(mesh))?;
        self.profile_name = Some(name.to_owned());
        Ok(())
    }

    pub fn remove_profile(&mut self, name: &str) -> bool {
        self.profiles.remove(name)
    }

    /// Stages removal of profiles stored by an incompatible version.
    pub fn prune_incompatible_profiles(&mut self) -> usize {
        self.profiles.check_incompatible()
    }

    /// Writes staged profile changes into `file`. Returns whether anything
    /// changed.
    pub fn commit_profiles(&mut self, file: &mut ConfigFile) -> bool {
        let changed = self.profiles.has_pending_changes();
        self.profiles.commit(file);
        changed
    }

    pub fn status(&self) -> BedMeshStatus {
        let mut status = BedMeshStatus {
            profile_name: self.profile_name.clone().unwrap_or_default(),
            mesh_min: (0.0, 0.0),
            mesh_max: (0.0, 0.0),
            probed_matrix: vec![vec![]],
            mesh_matrix: vec![vec![]],
            profiles: self.profiles.list().clone(),
        };
        if let Some(mesh) = self.transform.mesh() {
            let params = mesh.params();
            status.mesh_min = (params.min_x, params.min_y);
            status.mesh_max = (params.max_x, params.max_y);
            status.probed_matrix = mesh.probed_matrix().clone();
            status.mesh_matrix = mesh.mesh_matrix();
        }
        status
    }

    pub fn move_to(&mut self, toolhead: &mut dyn Toolhead, pos: Coord, speed: Mm) -> Result<()> {
        self.transform.move_to(toolhead, pos, speed)
    }

    pub fn get_position(&mut self, toolhead: &dyn Toolhead) -> Coord {
        self.transform.get_position(toolhead)
    }

    /// Forgets the cached position, e.g. after the toolhead position was
    /// redefined behind the engine's back.
    pub fn reset_position(&mut self) {
        self.transform.reset_position();
    }

    /// Runs one extended command and returns its console response.
    pub fn run_command(
        &mut self,
        cmd: &ExtendedCommand,
        probe: &mut dyn Probe,
        toolhead: &mut dyn Toolhead,
    ) -> Result<String> {
        match cmd.name() {
            "BED_MESH_CALIBRATE" => {
                let profile = cmd.get("PROFILE");
                if cmd.get("METHOD").map(|m| m.eq_ignore_ascii_case("manual")) == Some(true) {
                    self.start_manual_calibration(profile)?;
                    let step = self.manual_advance(toolhead)?;
                    return Ok(manual_step_message(&step));
                }
                self.calibrate(profile, probe, toolhead)?;
                Ok(format!(
                    "Mesh Bed Leveling Complete\nBed Mesh state has been saved to profile [{}]",
                    self.profile_name().unwrap_or(DEFAULT_PROFILE)
                ))
            }
            "ACCEPT" => {
                self.manual_confirm(toolhead)?;
                let step = self.manual_advance(toolhead)?;
                Ok(manual_step_message(&step))
            }
            "ABORT" => {
                self.manual_abort();
                Ok("Manual probe aborted".to_owned())
            }
            "TESTZ" => {
                let dz = cmd.get_float("Z")?.unwrap_or(0.0);
                let z = toolhead.get_position().z + dz;
                self.transform.reset_position();
                toolhead.move_to(None, None, Some(z), self.orchestrator.settings().lift_speed)?;
                Ok(format!("Z position: {z:.3}"))
            }
            "PROBE" => {
                let pos = self.probe_here(probe, toolhead)?;
                Ok(format!("probe at {:.3},{:.3} is z={:.6}", pos.x, pos.y, pos.z))
            }
            "BED_MESH_OUTPUT" => Ok(self.output(cmd.get_int("PGP")?.unwrap_or(0) != 0)),
            "BED_MESH_MAP" => self.map(),
            "BED_MESH_CLEAR" => {
                self.clear();
                Ok(String::new())
            }
            "BED_MESH_OFFSET" => {
                self.offset(cmd.get_float("X")?, cmd.get_float("Y")?)?;
                Ok(String::new())
            }
            "BED_MESH_PROFILE" => {
                if let Some(name) = cmd.get("SAVE") {
                    self.save_profile(name)?;
                    Ok(format!(
                        "Bed Mesh state has been saved to profile [{name}]\n\
                         for the current session. Commit the configuration to make it permanent."
                    ))
                } else if let Some(name) = cmd.get("LOAD") {
                    self.load_profile(name)?;
                    Ok(String::new())
                } else if let Some(name) = cmd.get("REMOVE") {
                    if self.remove_profile(name) {
                        Ok(format!(
                            "Profile [{name}] removed from storage for this session.\n\
                             Commit the configuration to make it permanent."
                        ))
                    } else {
                        Ok(format!("No profile named [{name}] to remove"))
                    }
                } else {
                    Err(BedMeshError::Parse {
                        input: cmd.to_string(),
                        message: "expected SAVE, LOAD or REMOVE".into(),
                    })
                }
            }
            other => Err(BedMeshError::Parse {
                input: other.to_owned(),
                message: "unknown command".into(),
            }),
        }
    }
}

fn manual_step_message(step: &ManualStep) -> String {
    match step {
        ManualStep::Point { index, x, y } => format!(
            "Manual probe point {index} at ({x:.2}, {y:.2}). Adjust with TESTZ, then ACCEPT or ABORT."
        ),
        ManualStep::Done(points) => {
            format!("Mesh Bed Leveling Complete ({} points)", points.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingToolhead, ScriptedProbe};

    fn config() -> BedMeshConfig {
        BedMeshConfig {
            mesh_min: Some((0.0, 0.0)),
            mesh_max: Some((100.0, 100.0)),
            ..BedMeshConfig::default()
        }
    }

    #[test]
    fn coord_sub_and_norm() {
        let d = Coord::new(3.0, 4.0, 12.0, 9.0) - Coord::new(0.0, 0.0, 0.0, 1.0);
        assert_eq!(d.norm_xyz(), 13.0);
        assert_eq!(d.e, 8.0);
    }

    #[test]
    fn calibrate_installs_and_saves_default() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut probe = ScriptedProbe::new(&[0.1; 9]);
        let mut toolhead = RecordingToolhead::default();
        bed.calibrate(None, &mut probe, &mut toolhead).unwrap();
        assert!(bed.mesh().is_some());
        assert_eq!(bed.profile_name(), Some(DEFAULT_PROFILE));
        assert!(bed.profiles().contains(DEFAULT_PROFILE));
        assert!(bed.profiles().has_pending_changes());
    }

    #[test]
    fn failed_calibration_keeps_previous_mesh() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut toolhead = RecordingToolhead::default();
        bed.calibrate(Some("first"), &mut ScriptedProbe::new(&[0.1; 9]), &mut toolhead)
            .unwrap();
        let before = Rc::clone(bed.mesh().unwrap());
        // Runs out of samples part way through.
        let mut short = ScriptedProbe::new(&[0.2; 4]);
        assert!(bed.calibrate(Some("second"), &mut short, &mut toolhead).is_err());
        assert!(Rc::ptr_eq(bed.mesh().unwrap(), &before));
        assert!(!bed.profiles().contains("second"));
        assert_eq!(short.sessions_ended, 1);
    }

    #[test]
    fn moves_after_failed_calibration_start_from_the_real_position() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut toolhead = RecordingToolhead::default();
        // Rows in probing order; the middle row runs right to left.
        let tilt = [0.0, 0.2, 0.4, 0.4, 0.2, 0.0, 0.0, 0.2, 0.4];
        bed.calibrate(None, &mut ScriptedProbe::new(&tilt), &mut toolhead)
            .unwrap();
        bed.move_to(&mut toolhead, Coord::new(0.0, 0.0, 0.2, 0.0), 50.0)
            .unwrap();

        let mut short = ScriptedProbe::new(&[0.0; 4]);
        assert!(bed.calibrate(None, &mut short, &mut toolhead).is_err());
        let start = toolhead.position;
        assert!(start.x != 0.0 || start.y != 0.0);

        toolhead.moves.clear();
        let target = Coord::new(100.0, 0.0, 0.2, 0.0);
        bed.move_to(&mut toolhead, target, 50.0).unwrap();
        assert!(toolhead.moves.len() > 1);
        for p in &toolhead.moves {
            let cross = (p.x - start.x) * (target.y - start.y) - (p.y - start.y) * (target.x - start.x);
            assert!(cross.abs() < 1e-6, "({}, {}) is off the travel line", p.x, p.y);
        }
    }

    #[test]
    fn single_point_command_runs_its_own_session() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut probe = ScriptedProbe::new(&[0.125]);
        let mut toolhead = RecordingToolhead::default();
        toolhead.position = Coord::new(20.0, 30.0, 2.0, 0.0);
        let cmd = ExtendedCommand::parse("PROBE").unwrap().unwrap();
        let msg = bed.run_command(&cmd, &mut probe, &mut toolhead).unwrap();
        assert_eq!(msg, "probe at 20.000,30.000 is z=0.125000");
        assert_eq!((probe.sessions_begun, probe.sessions_ended), (1, 1));
    }

    #[test]
    fn device_offsets_must_match_configuration() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut probe = ScriptedProbe::new(&[0.0; 9]).with_offsets((-20.0, 0.0, 0.5));
        let mut toolhead = RecordingToolhead::default();
        let err = bed.calibrate(None, &mut probe, &mut toolhead).unwrap_err();
        assert!(matches!(err, BedMeshError::Config(_)));
        assert_eq!(probe.sessions_begun, 0);
        assert!(bed.mesh().is_none());
    }

    #[test]
    fn commands_drive_profiles() {
        let mut bed = BedMesh::new(&config(), &ConfigFile::default()).unwrap();
        let mut probe = ScriptedProbe::new(&[0.0; 9]);
        let mut toolhead = RecordingToolhead::default();
        let mut run = |bed: &mut BedMesh, line: &str| {
            let cmd = ExtendedCommand::parse(line).unwrap().unwrap();
            bed.run_command(&cmd, &mut probe, &mut toolhead)
        };
        assert!(matches!(
            run(&mut bed, "BED_MESH_MAP"),
            Err(BedMeshError::NoMesh)
        ));
        run(&mut bed, "BED_MESH_CALIBRATE").unwrap();
        assert!(matches!(
            run(&mut bed, "BED_MESH_PROFILE SAVE=default"),
            Err(BedMeshError::ReservedProfileName(_))
        ));
        run(&mut bed, "BED_MESH_PROFILE SAVE=pla").unwrap();
        assert!(bed.profiles().contains("pla"));
        let map = run(&mut bed, "BED_MESH_MAP").unwrap();
        assert!(map.starts_with("mesh_map_output {"));
        assert!(map.contains("\"mesh_max\":[100.0,100.0]"));
        run(&mut bed, "BED_MESH_CLEAR").unwrap();
        assert!(bed.mesh().is_none());
        assert_eq!(bed.status().profile_name, "");
        run(&mut bed, "BED_MESH_PROFILE LOAD=pla").unwrap();
        assert_eq!(bed.profile_name(), Some("pla"));
        assert!(run(&mut bed, "BED_MESH_PROFILE REMOVE=pla")
            .unwrap()
            .starts_with("Profile [pla] removed"));
        assert!(matches!(
            run(&mut bed, "BED_MESH_PROFILE LOAD=pla"),
            Err(BedMeshError::UnknownProfile(_))
        ));
    }

    #[test]
    fn manual_calibration_through_commands() {
        let mut cfg = config();
        cfg.probe_count = (3, 3);
        let mut bed = BedMesh::new(&cfg, &ConfigFile::default()).unwrap();
        let mut probe = ScriptedProbe::new(&[]);
        let mut toolhead = RecordingToolhead::default();
        let calibrate = ExtendedCommand::parse("BED_MESH_CALIBRATE METHOD=manual PROFILE=hand")
            .unwrap()
            .unwrap();
        let accept = ExtendedCommand::parse("ACCEPT").unwrap().unwrap();
        let msg = bed.run_command(&calibrate, &mut probe, &mut toolhead).unwrap();
        assert!(msg.starts_with("Manual probe point 0"));
        for _ in 0..9 {
            toolhead.position.z = 0.05;
            bed.run_command(&accept, &mut probe, &mut toolhead).unwrap();
        }
        assert_eq!(bed.profile_name(), Some("hand"));
        let mesh = bed.mesh().unwrap();
        assert!(mesh.probed_matrix().iter().flatten().all(|z| *z == 0.05));
    }
}
