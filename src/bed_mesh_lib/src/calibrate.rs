//! Probe point generation and reduction of probe results into a mesh.

use crate::error::{BedMeshError, Result};
use crate::mesh::{round_to, InterpolationAlgorithm, MeshParams, ProbedMatrix, ZMesh};
use crate::probe::ProbePoint;
use crate::{Factor, Mm};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as fmt_Write;

// Probed and generated XY must agree this closely, and a Y change larger
// than this starts a new row.
const POINT_MATCH_TOLERANCE: Mm = 0.1;
const FAULT_REGION_TOLERANCE: Mm = 0.00001;
const MESH_BOUNDS_TOLERANCE: Mm = 0.000001;
const MIN_PROBE_SPACING: Mm = 1.0;

/// Axis aligned rectangle that must not be probed directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultRegion {
    pub min: (Mm, Mm),
    pub max: (Mm, Mm),
}

impl FaultRegion {
    /// Accepts any two opposite corners.
    pub fn new(a: (Mm, Mm), b: (Mm, Mm)) -> FaultRegion {
        FaultRegion {
            min: (a.0.min(b.0), a.1.min(b.1)),
            max: (a.0.max(b.0), a.1.max(b.1)),
        }
    }

    fn corners(&self) -> [(Mm, Mm); 4] {
        [
            self.min,
            (self.min.0, self.max.1),
            self.max,
            (self.max.0, self.min.1),
        ]
    }

    pub fn contains(&self, p: (Mm, Mm), tol: Mm) -> bool {
        within(p, self.min, self.max, tol)
    }
}

fn within(p: (Mm, Mm), min: (Mm, Mm), max: (Mm, Mm), tol: Mm) -> bool {
    max.0 + tol >= p.0 && p.0 >= min.0 - tol && max.1 + tol >= p.1 && p.1 >= min.1 - tol
}

fn isclose(a: Mm, b: Mm, abs_tol: Mm) -> bool {
    (a - b).abs() <= (1e-9 * a.abs().max(b.abs())).max(abs_tol)
}

/// Normalizes the corners of every region and rejects any pair where a
/// corner of one lies inside the other.
pub fn validate_fault_regions(regions: &[FaultRegion]) -> Result<Vec<FaultRegion>> {
    let mut accepted: Vec<FaultRegion> = Vec::with_capacity(regions.len());
    for (i, region) in regions.iter().enumerate() {
        let region = FaultRegion::new(region.min, region.max);
        for (j, prev) in accepted.iter().enumerate() {
            let overlaps = prev.corners().iter().any(|c| region.contains(*c, 0.0))
                || region.corners().iter().any(|c| prev.contains(*c, 0.0));
            if overlaps {
                return Err(BedMeshError::Config(format!(
                    "Existing faulty_region_{} {:?} overlaps added faulty_region_{} {:?}",
                    j + 1,
                    (prev.min, prev.max),
                    i + 1,
                    (region.min, region.max)
                )));
            }
        }
        accepted.push(region);
    }
    Ok(accepted)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BedShape {
    Rectangular { min: (Mm, Mm), max: (Mm, Mm) },
    Round { radius: Mm, origin: (Mm, Mm) },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshConfig {
    pub shape: BedShape,
    pub x_count: usize,
    pub y_count: usize,
    pub mesh_x_pps: usize,
    pub mesh_y_pps: usize,
    pub algo: InterpolationAlgorithm,
    pub tension: Factor,
    pub faulty_regions: Vec<FaultRegion>,
    pub relative_reference_index: Option<usize>,
}

impl MeshConfig {
    fn bounds(&self) -> ((Mm, Mm), (Mm, Mm)) {
        match self.shape {
            BedShape::Rectangular { min, max } => (min, max),
            BedShape::Round { radius, origin } => (
                (origin.0 - radius, origin.1 - radius),
                (origin.0 + radius, origin.1 + radius),
            ),
        }
    }

    /// Grid description before probing, used to validate the algorithm.
    pub fn mesh_params(&self) -> MeshParams {
        let (min, max) = self.bounds();
        MeshParams {
            min_x: min.0,
            max_x: max.0,
            min_y: min.1,
            max_y: max.1,
            x_count: self.x_count,
            y_count: self.y_count,
            mesh_x_pps: self.mesh_x_pps,
            mesh_y_pps: self.mesh_y_pps,
            algo: self.algo,
            tension: self.tension,
        }
    }
}

/// Boundary points probed in place of one generated point that fell inside
/// a fault region.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultSubstitution {
    pub index: usize,
    pub points: Vec<(Mm, Mm)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbePoints {
    base_points: Vec<(Mm, Mm)>,
    // Ordered by generated index; reduction walks them in sequence.
    substitutes: Vec<FaultSubstitution>,
}

impl ProbePoints {
    pub fn generate(config: &MeshConfig) -> Result<ProbePoints> {
        let (x_cnt, y_cnt) = (config.x_count, config.y_count);
        let ((mut min_x, mut min_y), (mut max_x, mut max_y)) = match config.shape {
            BedShape::Rectangular { min, max } => (min, max),
            BedShape::Round { radius, .. } => ((-radius, -radius), (radius, radius)),
        };
        // Step sizes truncated to the hundredth.
        let x_dist = ((max_x - min_x) / (x_cnt - 1) as Mm * 100.0).floor() / 100.0;
        let mut y_dist = ((max_y - min_y) / (y_cnt - 1) as Mm * 100.0).floor() / 100.0;
        if x_dist < MIN_PROBE_SPACING || y_dist < MIN_PROBE_SPACING {
            return Err(BedMeshError::Config(
                "min/max points too close together".into(),
            ));
        }
        let round = match config.shape {
            BedShape::Round { radius, origin } => {
                y_dist = x_dist;
                let new_r = (x_cnt / 2) as Mm * x_dist;
                min_x = -new_r;
                min_y = -new_r;
                max_x = new_r;
                max_y = new_r;
                Some((radius, origin))
            }
            BedShape::Rectangular { .. } => {
                max_x = min_x + x_dist * (x_cnt - 1) as Mm;
                max_y = min_y + y_dist * (y_cnt - 1) as Mm;
                None
            }
        };

        let mut base_points = Vec::with_capacity(x_cnt * y_cnt);
        let mut pos_y = min_y;
        for i in 0..y_cnt {
            for j in 0..x_cnt {
                // Serpentine: even rows run +X, odd rows run -X.
                let pos_x = if i % 2 == 0 {
                    min_x + j as Mm * x_dist
                } else {
                    max_x - j as Mm * x_dist
                };
                match round {
                    None => base_points.push((pos_x, pos_y)),
                    Some((radius, origin)) => {
                        if pos_x.hypot(pos_y) <= radius {
                            base_points.push((origin.0 + pos_x, origin.1 + pos_y));
                        }
                    }
                }
            }
            pos_y += y_dist;
        }

        let mut points = ProbePoints {
            base_points,
            substitutes: vec![],
        };
        let in_mesh = |p: (Mm, Mm)| match round {
            None => within(p, (min_x, min_y), (max_x, max_y), MESH_BOUNDS_TOLERANCE),
            Some((radius, origin)) => (p.0 - origin.0).hypot(p.1 - origin.1) <= radius,
        };
        points.substitute_faulty(&config.faulty_regions, in_mesh)?;
        Ok(points)
    }

    fn substitute_faulty(
        &mut self,
        regions: &[FaultRegion],
        in_mesh: impl Fn((Mm, Mm)) -> bool,
    ) -> Result<()> {
        let Some(first) = self.base_points.first() else {
            return Ok(());
        };
        let mut last_y = first.1;
        let mut is_reversed = false;
        for (i, &coord) in self.base_points.iter().enumerate() {
            if !isclose(coord.1, last_y, 0.0) {
                is_reversed = !is_reversed;
            }
            last_y = coord.1;
            let Some(region) = regions
                .iter()
                .find(|r| r.contains(coord, FAULT_REGION_TOLERANCE))
            else {
                continue;
            };
            let mut adj_coords = [
                (region.min.0, coord.1),
                (coord.0, region.min.1),
                (coord.0, region.max.1),
                (region.max.0, coord.1),
            ];
            if is_reversed {
                // Keep travel monotonic along a -X row.
                adj_coords.swap(0, 3);
            }
            let valid: Vec<(Mm, Mm)> = adj_coords.into_iter().filter(|c| in_mesh(*c)).collect();
            if valid.is_empty() {
                return Err(BedMeshError::Config(format!(
                    "Unable to generate coordinates for faulty region at index: {i}"
                )));
            }
            self.substitutes.push(FaultSubstitution {
                index: i,
                points: valid,
            });
        }
        Ok(())
    }

    pub fn base_points(&self) -> &[(Mm, Mm)] {
        &self.base_points
    }

    pub fn substitutes(&self) -> &[FaultSubstitution] {
        &self.substitutes
    }

    /// The order points are actually visited in, with each faulty point
    /// replaced by its substitutes.
    pub fn probe_path(&self) -> Vec<(Mm, Mm)> {
        let mut path = Vec::with_capacity(self.base_points.len());
        let mut subs = self.substitutes.iter().peekable();
        for (i, p) in self.base_points.iter().enumerate() {
            match subs.peek() {
                Some(sub) if sub.index == i => {
                    path.extend_from_slice(&sub.points);
                    subs.next();
                }
                _ => path.push(*p),
            }
        }
        path
    }
}

#[derive(Debug, Clone)]
pub struct MeshCalibrator {
    config: MeshConfig,
    points: ProbePoints,
}

impl MeshCalibrator {
    pub fn new(mut config: MeshConfig) -> Result<MeshCalibrator> {
        if let BedShape::Round { radius, .. } = &mut config.shape {
            if config.x_count != config.y_count || config.x_count % 2 == 0 {
                return Err(BedMeshError::Config(
                    "probe_count must be odd for round beds".into(),
                ));
            }
            // Radius carries at most 0.1 precision.
            *radius = (*radius * 10.0).floor() / 10.0;
        }
        config.algo = config.mesh_params().resolved()?.algo;
        config.faulty_regions = validate_fault_regions(&config.faulty_regions)?;
        let points = ProbePoints::generate(&config)?;
        if let Some(rri) = config.relative_reference_index {
            if rri >= points.base_points().len() {
                return Err(BedMeshError::Config(format!(
                    "relative_reference_index {rri} is out of range, mesh has {} points",
                    points.base_points().len()
                )));
            }
        }
        Ok(MeshCalibrator { config, points })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn points(&self) -> &ProbePoints {
        &self.points
    }

    pub fn probe_path(&self) -> Vec<(Mm, Mm)> {
        self.points.probe_path()
    }

    /// Turns the samples for `probe_path()` back into a probed matrix and
    /// builds the mesh. `offsets` are the probe offsets relative to the
    /// nozzle; `positions` are toolhead coordinates.
    pub fn finalize(
        &self,
        offsets: (Mm, Mm, Mm),
        positions: &[ProbePoint],
        name: &str,
    ) -> Result<ZMesh> {
        let (x_off, y_off, mut z_offset) = offsets;
        let positions: Vec<ProbePoint> = positions
            .iter()
            .map(|p| ProbePoint {
                x: round_to(p.x, 2),
                y: round_to(p.y, 2),
                z: p.z,
            })
            .collect();

        let corrected = self.collapse_substitutes(&positions, (x_off, y_off))?;
        let base_points = self.points.base_points();
        if base_points.len() != corrected.len() {
            self.dump_points(&positions, &corrected, (x_off, y_off));
            return Err(BedMeshError::ShapeMismatch {
                message: "invalid position list size".into(),
                expected: base_points.len(),
                actual: corrected.len(),
            });
        }
        for (gen, probed) in base_points.iter().zip(&corrected) {
            let off_pt = (gen.0 - x_off, gen.1 - y_off);
            if !isclose(off_pt.0, probed.x, POINT_MATCH_TOLERANCE)
                || !isclose(off_pt.1, probed.y, POINT_MATCH_TOLERANCE)
            {
                self.dump_points(&positions, &corrected, (x_off, y_off));
                return Err(BedMeshError::PointMismatch {
                    generated: off_pt,
                    probed: (probed.x, probed.y),
                });
            }
        }
        if let Some(rri) = self.config.relative_reference_index {
            z_offset = corrected[rri].z;
        }

        let mut params = self.config.mesh_params();
        let (min_x, max_x, min_y, max_y) = corrected.iter().fold(
            (Mm::INFINITY, Mm::NEG_INFINITY, Mm::INFINITY, Mm::NEG_INFINITY),
            |(x0, x1, y0, y1), p| (x0.min(p.x), x1.max(p.x), y0.min(p.y), y1.max(p.y)),
        );
        params.min_x = min_x + x_off;
        params.max_x = max_x + x_off;
        params.min_y = min_y + y_off;
        params.max_y = max_y + y_off;

        let probed_matrix = self.reduce_rows(&corrected, z_offset)?;
        ZMesh::build(&params, probed_matrix, name)
    }

    fn collapse_substitutes(
        &self,
        positions: &[ProbePoint],
        offsets: (Mm, Mm),
    ) -> Result<Vec<ProbePoint>> {
        let substitutes = self.points.substitutes();
        if substitutes.is_empty() {
            return Ok(positions.to_vec());
        }
        let base_points = self.points.base_points();
        let mut corrected = Vec::with_capacity(base_points.len());
        let mut idx_offset = 0;
        let mut start_idx = 0;
        for sub in substitutes {
            let idx = sub.index + idx_offset;
            let end = idx + sub.points.len();
            if end > positions.len() {
                self.dump_points(positions, &corrected, offsets);
                return Err(BedMeshError::ShapeMismatch {
                    message: format!("missing samples for faulty index {}", sub.index),
                    expected: end,
                    actual: positions.len(),
                });
            }
            corrected.extend_from_slice(&positions[start_idx..idx]);
            let avg_z =
                positions[idx..end].iter().map(|p| p.z).sum::<Mm>() / sub.points.len() as Mm;
            idx_offset += sub.points.len() - 1;
            start_idx = end;
            let gen = base_points[sub.index];
            let fpt = ProbePoint {
                x: gen.0 - offsets.0,
                y: gen.1 - offsets.1,
                z: avg_z,
            };
            log::info!(
                "bed_mesh: Replacing value at faulty index {} ({:.4}, {:.4}): avg value = {avg_z:.6}",
                sub.index,
                fpt.x,
                fpt.y
            );
            corrected.push(fpt);
        }
        corrected.extend_from_slice(&positions[start_idx..]);
        Ok(corrected)
    }

    fn reduce_rows(&self, positions: &[ProbePoint], z_offset: Mm) -> Result<ProbedMatrix> {
        let (x_cnt, y_cnt) = (self.config.x_count, self.config.y_count);
        let mut probed_matrix: ProbedMatrix = vec![];
        let mut row: VecDeque<Mm> = VecDeque::with_capacity(x_cnt);
        let mut prev_pos = match positions.first() {
            Some(p) => *p,
            None => {
                return Err(BedMeshError::ShapeMismatch {
                    message: "no probe results".into(),
                    expected: self.points.base_points().len(),
                    actual: 0,
                })
            }
        };
        for pos in positions {
            if !isclose(pos.y, prev_pos.y, POINT_MATCH_TOLERANCE) {
                probed_matrix.push(row.drain(..).collect());
            }
            // Undo the serpentine order so every row ascends in X.
            if pos.x > prev_pos.x {
                row.push_back(pos.z - z_offset);
            } else {
                row.push_front(pos.z - z_offset);
            }
            prev_pos = *pos;
        }
        probed_matrix.push(row.into_iter().collect());

        if probed_matrix.len() != y_cnt {
            return Err(BedMeshError::ShapeMismatch {
                message: format!("Invalid y-axis table length, probed table: {probed_matrix:?}"),
                expected: y_cnt,
                actual: probed_matrix.len(),
            });
        }

        if let BedShape::Round { .. } = self.config.shape {
            // Square off a round mesh by repeating each row's outer values.
            for row in probed_matrix.iter_mut() {
                let row_size = row.len();
                if row_size % 2 == 0 {
                    return Err(BedMeshError::ShapeMismatch {
                        message: "incorrect number of points sampled on X".into(),
                        expected: x_cnt,
                        actual: row_size,
                    });
                }
                let buf_cnt = x_cnt.saturating_sub(row_size) / 2;
                if buf_cnt == 0 {
                    continue;
                }
                let (first, last) = (row[0], row[row_size - 1]);
                let mut padded = vec![first; buf_cnt];
                padded.append(row);
                padded.extend(std::iter::repeat(last).take(buf_cnt));
                *row = padded;
            }
        }

        if let Some(row) = probed_matrix.iter().find(|row| row.len() != x_cnt) {
            return Err(BedMeshError::ShapeMismatch {
                message: "invalid x-axis table length".into(),
                expected: x_cnt,
                actual: row.len(),
            });
        }
        Ok(probed_matrix)
    }

    fn dump_points(&self, probed: &[ProbePoint], corrected: &[ProbePoint], offsets: (Mm, Mm)) {
        let base_points = self.points.base_points();
        let max_len = base_points.len().max(probed.len()).max(corrected.len());
        let mut msg = format!(
            "bed_mesh: calibration point dump\nIndex | {:<17}| {:<25}| Corrected Point",
            "Generated Point", "Probed Point"
        );
        for i in 0..max_len {
            let gen_pt = base_points
                .get(i)
                .map(|p| format!("({:.2}, {:.2})", p.0 - offsets.0, p.1 - offsets.1))
                .unwrap_or_default();
            let probed_pt = probed.get(i).map(|p| p.to_string()).unwrap_or_default();
            let corr_pt = corrected.get(i).map(|p| p.to_string()).unwrap_or_default();
            write!(msg, "\n  {i:<4}| {gen_pt:<17}| {probed_pt:<25}| {corr_pt}").expect("write failed");
        }
        log::error!("{msg}");
    }

    /// Listing of generated points for `BED_MESH_OUTPUT PGP=1`.
    pub fn generated_points_report(&self, probe_offsets: (Mm, Mm)) -> String {
        let (x_offset, y_offset) = probe_offsets;
        let mut msg = String::from("bed_mesh: generated points\nIndex | Tool Adjusted | Probe\n");
        let points = self.points.base_points();
        for (i, (x, y)) in points.iter().enumerate() {
            let adj_pt = format!("({:.1}, {:.1})", x - x_offset, y - y_offset);
            let mesh_pt = format!("({x:.1}, {y:.1})");
            writeln!(msg, "  {i:<4}| {adj_pt:<16}| {mesh_pt}").expect("write failed");
        }
        if let Some(rri) = self.config.relative_reference_index {
            let (x, y) = points[rri];
            writeln!(
                msg,
                "bed_mesh: relative_reference_index {rri} is ({:.2}, {:.2})",
                x - x_offset,
                y - y_offset
            )
            .expect("write failed");
        }
        if !self.points.substitutes().is_empty() {
            msg.push_str("bed_mesh: faulty region points\n");
            for sub in self.points.substitutes() {
                let (x, y) = points[sub.index];
                let subs: Vec<String> = sub
                    .points
                    .iter()
                    .map(|(sx, sy)| format!("({sx:.2}, {sy:.2})"))
                    .collect();
                writeln!(
                    msg,
                    "{} ({x:.2}, {y:.2}), substituted points: [{}]",
                    sub.index,
                    subs.join(", ")
                )
                .expect("write failed");
            }
        }
        msg
    }
}
