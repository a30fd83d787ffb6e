//! Folds the active mesh into every planned move: height fade-out and
//! subdivision of long moves so the correction follows the surface.

use crate::error::{BedMeshError, Result};
use crate::mesh::{lerp, ZMesh};
use crate::{Coord, Factor, Mm, Toolhead};
use std::rc::Rc;

pub const SPLIT_DELTA_Z_DEFAULT: Mm = 0.025;
pub const SPLIT_DELTA_Z_MIN: Mm = 0.01;
pub const MOVE_CHECK_DISTANCE_DEFAULT: Mm = 5.0;
pub const MOVE_CHECK_DISTANCE_MIN: Mm = 3.0;

// Axis displacement below this counts as no movement on that axis.
const AXIS_MOVE_TOLERANCE: Mm = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeConfig {
    pub fade_start: Mm,
    pub fade_end: Mm,
    /// Height the correction fades towards. `None` uses the mesh average.
    pub fade_target: Option<Mm>,
}

impl Default for FadeConfig {
    fn default() -> Self {
        FadeConfig {
            fade_start: 1.0,
            fade_end: 0.0,
            fade_target: None,
        }
    }
}

/// Height dependent weight of the correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fade {
    start: Mm,
    end: Mm,
    enabled: bool,
}

impl Fade {
    /// A band with `end <= start` disables fading rather than being an error.
    pub fn new(start: Mm, end: Mm) -> Fade {
        Fade {
            start,
            end,
            enabled: end > start,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn distance(&self) -> Mm {
        self.end - self.start
    }

    /// 1.0 below the band, 0.0 at or above its end, linear in between.
    pub fn factor(&self, z: Mm) -> Factor {
        if !self.enabled {
            1.0
        } else if z >= self.end {
            0.0
        } else if z >= self.start {
            (self.end - z) / self.distance()
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitConfig {
    pub split_delta_z: Mm,
    pub move_check_distance: Mm,
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            split_delta_z: SPLIT_DELTA_Z_DEFAULT,
            move_check_distance: MOVE_CHECK_DISTANCE_DEFAULT,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.split_delta_z < SPLIT_DELTA_Z_MIN {
            return Err(BedMeshError::Config(format!(
                "split_delta_z must be at least {SPLIT_DELTA_Z_MIN}, got {}",
                self.split_delta_z
            )));
        }
        if self.move_check_distance < MOVE_CHECK_DISTANCE_MIN {
            return Err(BedMeshError::Config(format!(
                "move_check_distance must be at least {MOVE_CHECK_DISTANCE_MIN}, got {}",
                self.move_check_distance
            )));
        }
        Ok(())
    }

    /// Starts subdividing the move `prev -> next` against `mesh`.
    pub fn split_move(
        &self,
        mesh: Rc<ZMesh>,
        fade_target: Mm,
        prev: Coord,
        next: Coord,
        factor: Factor,
    ) -> SplitMove {
        let delta = next - prev;
        let axis_move = [
            delta.x.abs() > AXIS_MOVE_TOLERANCE,
            delta.y.abs() > AXIS_MOVE_TOLERANCE,
            delta.z.abs() > AXIS_MOVE_TOLERANCE,
            delta.e.abs() > AXIS_MOVE_TOLERANCE,
        ];
        let mut split = SplitMove {
            mesh,
            config: *self,
            fade_target,
            prev,
            next,
            current: prev,
            z_factor: factor,
            z_offset: 0.0,
            traverse_complete: false,
            distance_checked: 0.0,
            total_move_length: delta.norm_xyz(),
            axis_move,
        };
        split.z_offset = split.calc_z_offset(prev);
        split
    }
}

/// State for one planned move. Yields sub-move endpoints with the Z
/// correction applied; the final item is always the original target.
#[derive(Debug)]
pub struct SplitMove {
    mesh: Rc<ZMesh>,
    config: SplitConfig,
    fade_target: Mm,
    prev: Coord,
    next: Coord,
    current: Coord,
    z_factor: Factor,
    z_offset: Mm,
    traverse_complete: bool,
    distance_checked: Mm,
    total_move_length: Mm,
    axis_move: [bool; 4],
}

impl SplitMove {
    fn calc_z_offset(&self, pos: Coord) -> Mm {
        let z = self.mesh.calc_z(pos.x, pos.y);
        self.z_factor * (z - self.fade_target) + self.fade_target
    }

    fn set_next_move(&mut self, distance_from_prev: Mm) -> Result<()> {
        let t = distance_from_prev / self.total_move_length;
        if !(0.0..=1.0).contains(&t) {
            return Err(BedMeshError::SplitRange { t });
        }
        let (prev, next) = (self.prev, self.next);
        let cur = &mut self.current;
        if self.axis_move[0] {
            cur.x = lerp(t, prev.x, next.x);
        }
        if self.axis_move[1] {
            cur.y = lerp(t, prev.y, next.y);
        }
        if self.axis_move[2] {
            cur.z = lerp(t, prev.z, next.z);
        }
        if self.axis_move[3] {
            cur.e = lerp(t, prev.e, next.e);
        }
        Ok(())
    }
}

impl Iterator for SplitMove {
    type Item = Result<Coord>;

    fn next(&mut self) -> Option<Result<Coord>> {
        if self.traverse_complete {
            return None;
        }
        if self.axis_move[0] || self.axis_move[1] {
            while self.distance_checked + self.config.move_check_distance < self.total_move_length {
                self.distance_checked += self.config.move_check_distance;
                if let Err(e) = self.set_next_move(self.distance_checked) {
                    self.traverse_complete = true;
                    return Some(Err(e));
                }
                let next_z = self.calc_z_offset(self.current);
                if (next_z - self.z_offset).abs() > self.config.split_delta_z {
                    self.z_offset = next_z;
                    let mut split = self.current;
                    split.z += self.z_offset;
                    return Some(Ok(split));
                }
            }
        }
        // The last segment lands exactly on the target; nothing follows it,
        // so its offset is never compared against the threshold.
        self.current = self.next;
        self.z_offset = self.calc_z_offset(self.current);
        self.current.z += self.z_offset;
        self.traverse_complete = true;
        Some(Ok(self.current))
    }
}

/// Holds the active mesh and rewrites moves on their way to the toolhead.
#[derive(Debug)]
pub struct MeshTransform {
    fade: Fade,
    base_fade_target: Option<Mm>,
    fade_target: Mm,
    split: SplitConfig,
    z_mesh: Option<Rc<ZMesh>>,
    // None forces the next query to re-read the toolhead.
    last_position: Option<Coord>,
    log_fade_complete: bool,
}

impl MeshTransform {
    pub fn new(fade: &FadeConfig, split: SplitConfig) -> Result<MeshTransform> {
        split.validate()?;
        Ok(MeshTransform {
            fade: Fade::new(fade.fade_start, fade.fade_end),
            base_fade_target: fade.fade_target,
            fade_target: 0.0,
            split,
            z_mesh: None,
            last_position: None,
            log_fade_complete: false,
        })
    }

    pub fn mesh(&self) -> Option<&Rc<ZMesh>> {
        self.z_mesh.as_ref()
    }

    pub fn fade(&self) -> &Fade {
        &self.fade
    }

    pub fn fade_target(&self) -> Mm {
        self.fade_target
    }

    pub fn z_factor(&self, z: Mm) -> Factor {
        self.fade.factor(z)
    }

    /// Installs `mesh` (or clears with `None`). The swap is a single
    /// reference replacement; a rejected mesh leaves the active one in place.
    pub fn set_mesh(&mut self, mesh: Option<ZMesh>) -> Result<()> {
        let mut fade_target = 0.0;
        if let Some(mesh) = &mesh {
            if self.fade.is_enabled() {
                let (min_z, max_z) = mesh.z_range();
                match self.base_fade_target {
                    None => fade_target = mesh.avg_z(),
                    Some(target) => {
                        if !(min_z..=max_z).contains(&target) && target != 0.0 {
                            return Err(BedMeshError::FadeRange(format!(
                                "ERROR, fade_target lies outside of mesh z range\nmin: {min_z:.4}, max: {max_z:.4}, fade_target: {target:.4}"
                            )));
                        }
                        fade_target = target;
                    }
                }
                if self.fade.distance() <= min_z.abs().max(max_z.abs()) {
                    return Err(BedMeshError::FadeRange(format!(
                        "Mesh extends outside of the fade range, please see the fade_start and fade_end options. fade distance: {:.2} mesh min: {min_z:.4} mesh max: {max_z:.4}",
                        self.fade.distance()
                    )));
                }
                self.log_fade_complete = true;
            }
        }
        self.fade_target = fade_target;
        self.z_mesh = mesh.map(Rc::new);
        self.last_position = None;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.fade_target = 0.0;
        self.z_mesh = None;
        self.last_position = None;
    }

    pub fn reset_position(&mut self) {
        self.last_position = None;
    }

    /// Swaps in a copy of the active mesh with new lookup offsets.
    pub fn set_offsets(&mut self, x: Option<Mm>, y: Option<Mm>) -> Result<()> {
        let mesh = self.z_mesh.as_ref().ok_or(BedMeshError::NoMesh)?;
        self.z_mesh = Some(Rc::new(mesh.with_offsets(x, y)));
        self.last_position = None;
        Ok(())
    }

    /// Position in the uncorrected coordinate space.
    pub fn get_position(&mut self, toolhead: &dyn Toolhead) -> Coord {
        let pos = toolhead.get_position();
        let position = match &self.z_mesh {
            None => Coord {
                z: pos.z - self.fade_target,
                ..pos
            },
            Some(mesh) => {
                let max_adj = mesh.calc_z(pos.x, pos.y);
                let z_adj = max_adj - self.fade_target;
                let mut factor = 1.0;
                if self.fade.is_enabled() {
                    let (start, end) = (self.fade.start, self.fade.end);
                    if pos.z.min(pos.z - max_adj) >= end {
                        factor = 0.0;
                    } else if pos.z.max(pos.z - max_adj) >= start {
                        // The commanded Z is unknown here, recover the factor
                        // algebraically from the toolhead Z instead.
                        factor = ((end + self.fade_target - pos.z) / (self.fade.distance() - z_adj))
                            .clamp(0.0, 1.0);
                    }
                }
                let final_z_adj = factor * z_adj + self.fade_target;
                Coord {
                    z: pos.z - final_z_adj,
                    ..pos
                }
            }
        };
        self.last_position = Some(position);
        position
    }

    /// Queues `newpos` on `toolhead`, corrected and split as needed.
    pub fn move_to(&mut self, toolhead: &mut dyn Toolhead, newpos: Coord, speed: Mm) -> Result<()> {
        let prev = match self.last_position {
            Some(pos) => pos,
            None => self.get_position(toolhead),
        };
        let factor = self.z_factor(newpos.z);
        match &self.z_mesh {
            Some(mesh) if factor != 0.0 => {
                let split = self
                    .split
                    .split_move(Rc::clone(mesh), self.fade_target, prev, newpos, factor);
                for pos in split {
                    toolhead.queue_move(pos?, speed)?;
                }
            }
            _ => {
                if self.log_fade_complete {
                    self.log_fade_complete = false;
                    log::info!(
                        "bed_mesh fade complete: Current Z: {:.4} fade_target: {:.4}",
                        newpos.z,
                        self.fade_target
                    );
                }
                let pos = Coord {
                    z: newpos.z + self.fade_target,
                    ..newpos
                };
                toolhead.queue_move(pos, speed)?;
            }
        }
        self.last_position = Some(newpos);
        Ok(())
    }
}
