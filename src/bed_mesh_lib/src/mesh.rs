//! Dense correction surface built from a sparse probed height matrix.
//!
//! A [`ZMesh`] is immutable once built. Lookups go through [`ZMesh::calc_z`],
//! which is pure index arithmetic plus a bilinear blend so it can sit on the
//! per-move hot path.

use crate::error::{BedMeshError, Result};
use crate::{Factor, Mm};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as fmt_Write;
use std::str::FromStr;

// Lagrange interpolation oscillates badly beyond this many samples per axis.
pub const LAGRANGE_MAX_PROBE_COUNT: usize = 6;
pub const BICUBIC_MIN_PROBE_COUNT: usize = 4;
pub const MIN_PROBE_COUNT: usize = 3;

pub type ProbedMatrix = Vec<Vec<Mm>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationAlgorithm {
    /// Global polynomial through every probed value on the axis.
    Lagrange,
    /// Local cardinal spline over the two nearest probed neighbours per side.
    Bicubic,
    /// No densification, the probed matrix is the mesh.
    Direct,
}

impl InterpolationAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpolationAlgorithm::Lagrange => "lagrange",
            InterpolationAlgorithm::Bicubic => "bicubic",
            InterpolationAlgorithm::Direct => "direct",
        }
    }
}

impl fmt::Display for InterpolationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterpolationAlgorithm {
    type Err = BedMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lagrange" => Ok(InterpolationAlgorithm::Lagrange),
            "bicubic" => Ok(InterpolationAlgorithm::Bicubic),
            "direct" => Ok(InterpolationAlgorithm::Direct),
            other => Err(BedMeshError::Config(format!(
                "Unknown algorithm <{other}>"
            ))),
        }
    }
}

/// Grid description a mesh is built from. Field order is the persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshParams {
    pub min_x: Mm,
    pub max_x: Mm,
    pub min_y: Mm,
    pub max_y: Mm,
    pub x_count: usize,
    pub y_count: usize,
    pub mesh_x_pps: usize,
    pub mesh_y_pps: usize,
    pub algo: InterpolationAlgorithm,
    pub tension: Factor,
}

impl MeshParams {
    /// Applies the algorithm selection rules and returns the params a mesh
    /// will actually be built with.
    ///
    /// Both densification factors zero selects direct copy. Lagrange above
    /// six points per axis is rejected. Bicubic with fewer than four points
    /// on an axis is downgraded to Lagrange, unless the other axis is too
    /// long for Lagrange, which is rejected.
    pub fn resolved(&self) -> Result<MeshParams> {
        if self.x_count < MIN_PROBE_COUNT || self.y_count < MIN_PROBE_COUNT {
            return Err(BedMeshError::Config(format!(
                "probe_count must be at least {MIN_PROBE_COUNT} on each axis, got {},{}",
                self.x_count, self.y_count
            )));
        }
        if !(0.0..=2.0).contains(&self.tension) {
            return Err(BedMeshError::Config(format!(
                "bicubic_tension must be within [0, 2], got {}",
                self.tension
            )));
        }
        let mut params = self.clone();
        let max_probe_cnt = self.x_count.max(self.y_count);
        let min_probe_cnt = self.x_count.min(self.y_count);
        if self.mesh_x_pps == 0 && self.mesh_y_pps == 0 {
            params.algo = InterpolationAlgorithm::Direct;
        } else if self.algo == InterpolationAlgorithm::Lagrange
            && max_probe_cnt > LAGRANGE_MAX_PROBE_COUNT
        {
            return Err(BedMeshError::Config(format!(
                "cannot exceed a probe_count of {LAGRANGE_MAX_PROBE_COUNT} when using lagrange interpolation. Configured Probe Count: {}, {}",
                self.x_count, self.y_count
            )));
        } else if self.algo == InterpolationAlgorithm::Bicubic
            && min_probe_cnt < BICUBIC_MIN_PROBE_COUNT
        {
            if max_probe_cnt > LAGRANGE_MAX_PROBE_COUNT {
                return Err(BedMeshError::Config(format!(
                    "invalid probe_count option when using bicubic interpolation. Combination of 3 points on one axis with more than {LAGRANGE_MAX_PROBE_COUNT} on another is not permitted. Configured Probe Count: {}, {}",
                    self.x_count, self.y_count
                )));
            }
            log::info!(
                "bed_mesh: bicubic interpolation with a probe_count of less than {BICUBIC_MIN_PROBE_COUNT} points detected. Forcing lagrange interpolation. Configured Probe Count: {}, {}",
                self.x_count,
                self.y_count
            );
            params.algo = InterpolationAlgorithm::Lagrange;
        } else if self.algo == InterpolationAlgorithm::Direct {
            // Direct only makes sense without densification.
            return Err(BedMeshError::Config(
                "direct interpolation requires mesh_pps of 0,0".into(),
            ));
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    X,
    Y,
}

#[derive(Debug, Clone)]
pub struct ZMesh {
    name: String,
    params: MeshParams,
    probed_matrix: ProbedMatrix,
    mesh_matrix: Vec<Vec<Mm>>,
    avg_z: Mm,
    offsets: (Mm, Mm),
    x_mult: usize,
    y_mult: usize,
    mesh_x_count: usize,
    mesh_y_count: usize,
    mesh_x_dist: Mm,
    mesh_y_dist: Mm,
}

impl ZMesh {
    /// Builds the dense mesh for `probed`, which must be `y_count` rows of
    /// `x_count` heights with row 0 at `min_y` and each row ascending in X.
    pub fn build(params: &MeshParams, probed: ProbedMatrix, name: &str) -> Result<ZMesh> {
        let params = params.resolved()?;
        if probed.len() != params.y_count {
            return Err(BedMeshError::ShapeMismatch {
                message: "probed matrix has the wrong number of rows".into(),
                expected: params.y_count,
                actual: probed.len(),
            });
        }
        if let Some(row) = probed.iter().find(|row| row.len() != params.x_count) {
            return Err(BedMeshError::ShapeMismatch {
                message: "probed matrix row has the wrong number of columns".into(),
                expected: params.x_count,
                actual: row.len(),
            });
        }
        let mesh_x_count = (params.x_count - 1) * params.mesh_x_pps + params.x_count;
        let mesh_y_count = (params.y_count - 1) * params.mesh_y_pps + params.y_count;
        let mut mesh = ZMesh {
            name: name.to_owned(),
            x_mult: params.mesh_x_pps + 1,
            y_mult: params.mesh_y_pps + 1,
            mesh_x_count,
            mesh_y_count,
            mesh_x_dist: (params.max_x - params.min_x) / (mesh_x_count - 1) as Mm,
            mesh_y_dist: (params.max_y - params.min_y) / (mesh_y_count - 1) as Mm,
            params,
            probed_matrix: probed,
            mesh_matrix: vec![],
            avg_z: 0.0,
            offsets: (0.0, 0.0),
        };
        match mesh.params.algo {
            InterpolationAlgorithm::Direct => mesh.mesh_matrix = mesh.probed_matrix.clone(),
            InterpolationAlgorithm::Lagrange => mesh.sample_lagrange(),
            InterpolationAlgorithm::Bicubic => mesh.sample_bicubic(),
        }
        let cell_count = (mesh.mesh_x_count * mesh.mesh_y_count) as Mm;
        let total: Mm = mesh.mesh_matrix.iter().flatten().sum();
        mesh.avg_z = round_to(total / cell_count, 2);
        log::debug!(
            "bed_mesh: built {}x{} {} mesh [{}], average {:.2}",
            mesh.mesh_x_count,
            mesh.mesh_y_count,
            mesh.params.algo,
            mesh.name,
            mesh.avg_z
        );
        Ok(mesh)
    }

    /// Returns a copy of this mesh with new lookup offsets. `None` keeps the
    /// current offset on that axis.
    pub fn with_offsets(&self, x: Option<Mm>, y: Option<Mm>) -> ZMesh {
        let mut mesh = self.clone();
        if let Some(x) = x {
            mesh.offsets.0 = x;
        }
        if let Some(y) = y {
            mesh.offsets.1 = y;
        }
        mesh
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &MeshParams {
        &self.params
    }

    pub fn probed_matrix(&self) -> &ProbedMatrix {
        &self.probed_matrix
    }

    /// Dense matrix rounded to 6 places, row 0 at `min_y`.
    pub fn mesh_matrix(&self) -> Vec<Vec<Mm>> {
        self.mesh_matrix
            .iter()
            .map(|row| row.iter().map(|z| round_to(*z, 6)).collect())
            .collect()
    }

    pub fn avg_z(&self) -> Mm {
        self.avg_z
    }

    pub fn offsets(&self) -> (Mm, Mm) {
        self.offsets
    }

    pub fn mesh_counts(&self) -> (usize, usize) {
        (self.mesh_x_count, self.mesh_y_count)
    }

    pub fn z_range(&self) -> (Mm, Mm) {
        self.mesh_matrix
            .iter()
            .flatten()
            .fold((Mm::INFINITY, Mm::NEG_INFINITY), |(lo, hi), z| {
                (lo.min(*z), hi.max(*z))
            })
    }

    pub fn x_coordinate(&self, index: usize) -> Mm {
        self.params.min_x + self.mesh_x_dist * index as Mm
    }

    pub fn y_coordinate(&self, index: usize) -> Mm {
        self.params.min_y + self.mesh_y_dist * index as Mm
    }

    /// Corrected height at `(x, y)`. Coordinates outside the mesh clamp to
    /// the nearest edge cell.
    pub fn calc_z(&self, x: Mm, y: Mm) -> Mm {
        let tbl = &self.mesh_matrix;
        let (tx, xidx) = self.linear_index(x + self.offsets.0, Axis::X);
        let (ty, yidx) = self.linear_index(y + self.offsets.1, Axis::Y);
        let z0 = lerp(tx, tbl[yidx][xidx], tbl[yidx][xidx + 1]);
        let z1 = lerp(tx, tbl[yidx + 1][xidx], tbl[yidx + 1][xidx + 1]);
        lerp(ty, z0, z1)
    }

    fn linear_index(&self, coord: Mm, axis: Axis) -> (Factor, usize) {
        let (mesh_min, mesh_cnt, mesh_dist) = match axis {
            Axis::X => (self.params.min_x, self.mesh_x_count, self.mesh_x_dist),
            Axis::Y => (self.params.min_y, self.mesh_y_count, self.mesh_y_dist),
        };
        let raw = ((coord - mesh_min) / mesh_dist).floor();
        let idx = if raw.is_nan() || raw < 0.0 {
            0
        } else {
            (raw as usize).min(mesh_cnt - 2)
        };
        let t = (coord - (mesh_min + mesh_dist * idx as Mm)) / mesh_dist;
        (t.clamp(0.0, 1.0), idx)
    }

    // Dense matrix with probed values at their nodes and zero elsewhere.
    fn seeded_matrix(&self) -> Vec<Vec<Mm>> {
        (0..self.mesh_y_count)
            .map(|j| {
                (0..self.mesh_x_count)
                    .map(|i| {
                        if i % self.x_mult != 0 || j % self.y_mult != 0 {
                            0.0
                        } else {
                            self.probed_matrix[j / self.y_mult][i / self.x_mult]
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn sample_lagrange(&mut self) {
        let mut matrix = self.seeded_matrix();
        let xpts: Vec<Mm> = (0..self.params.x_count)
            .map(|i| self.x_coordinate(i * self.x_mult))
            .collect();
        let ypts: Vec<Mm> = (0..self.params.y_count)
            .map(|j| self.y_coordinate(j * self.y_mult))
            .collect();
        // Rows holding probed values first, then every column.
        for j in (0..self.mesh_y_count).step_by(self.y_mult) {
            for i in 0..self.mesh_x_count {
                if i % self.x_mult == 0 {
                    continue;
                }
                let x = self.x_coordinate(i);
                let row = &matrix[j];
                let z = lagrange(&xpts, x, |k| row[k * self.x_mult]);
                matrix[j][i] = z;
            }
        }
        for i in 0..self.mesh_x_count {
            for j in 0..self.mesh_y_count {
                if j % self.y_mult == 0 {
                    continue;
                }
                let y = self.y_coordinate(j);
                let z = lagrange(&ypts, y, |k| matrix[k * self.y_mult][i]);
                matrix[j][i] = z;
            }
        }
        self.mesh_matrix = matrix;
    }

    fn sample_bicubic(&mut self) {
        let mut matrix = self.seeded_matrix();
        let tension = self.params.tension;
        for j in (0..self.mesh_y_count).step_by(self.y_mult) {
            for i in 0..self.mesh_x_count {
                if i % self.x_mult == 0 {
                    continue;
                }
                let row = &matrix[j];
                let (pts, t) = control_points(i, self.x_mult, self.mesh_x_count, |k| row[k]);
                matrix[j][i] = cardinal_spline(pts, t, tension);
            }
        }
        for i in 0..self.mesh_x_count {
            for j in 0..self.mesh_y_count {
                if j % self.y_mult == 0 {
                    continue;
                }
                let (pts, t) =
                    control_points(j, self.y_mult, self.mesh_y_count, |k| matrix[k][i]);
                matrix[j][i] = cardinal_spline(pts, t, tension);
            }
        }
        self.mesh_matrix = matrix;
    }

    pub fn probed_matrix_report(&self) -> String {
        let mut msg = String::from("Mesh Leveling Probed Z positions:\n");
        for line in &self.probed_matrix {
            for z in line {
                write!(msg, " {z:.6}").expect("write failed");
            }
            msg.push('\n');
        }
        msg
    }

    pub fn mesh_report(&self, move_z: Option<Mm>) -> String {
        let mut msg = String::new();
        let (min_z, max_z) = self.z_range();
        writeln!(msg, "Mesh X,Y: {},{}", self.mesh_x_count, self.mesh_y_count).expect("write failed");
        if let Some(move_z) = move_z {
            writeln!(msg, "Search Height: {}", move_z as i64).expect("write failed");
        }
        writeln!(msg, "Mesh Offsets: X={:.4}, Y={:.4}", self.offsets.0, self.offsets.1).expect("write failed");
        writeln!(msg, "Mesh Average: {:.2}", self.avg_z).expect("write failed");
        writeln!(msg, "Mesh Range: min={min_z:.4} max={max_z:.4}").expect("write failed");
        writeln!(msg, "Interpolation Algorithm: {}", self.params.algo).expect("write failed");
        msg.push_str("Measured points:\n");
        // Printed top down so the report reads like the bed seen from above.
        for line in self.mesh_matrix().iter().rev() {
            for z in line {
                write!(msg, "  {z:.6}").expect("write failed");
            }
            msg.push('\n');
        }
        msg
    }
}

pub fn lerp(t: Factor, v0: Mm, v1: Mm) -> Mm {
    (1.0 - t) * v0 + t * v1
}

pub fn round_to(v: Mm, places: i32) -> Mm {
    let scale = (10.0 as Mm).powi(places);
    (v * scale).round() / scale
}

fn lagrange(pts: &[Mm], c: Mm, z_at: impl Fn(usize) -> Mm) -> Mm {
    let mut total = 0.0;
    for (i, pi) in pts.iter().enumerate() {
        let mut n = 1.0;
        let mut d = 1.0;
        for (j, pj) in pts.iter().enumerate() {
            if j == i {
                continue;
            }
            n *= c - pj;
            d *= pi - pj;
        }
        total += z_at(i) * n / d;
    }
    total
}

// Control points p0..p3 around dense index `idx` along one axis, with the
// edge neighbour duplicated at either boundary, and the parameter t within
// the enclosing probed segment.
fn control_points(
    idx: usize,
    mult: usize,
    count: usize,
    z_at: impl Fn(usize) -> Mm,
) -> ([Mm; 4], Factor) {
    let last_pt = count - 1 - mult;
    if idx < mult {
        let p1 = z_at(0);
        (
            [p1, p1, z_at(mult), z_at(2 * mult)],
            idx as Factor / mult as Factor,
        )
    } else if idx > last_pt {
        let p2 = z_at(last_pt + mult);
        (
            [z_at(last_pt - mult), z_at(last_pt), p2, p2],
            (idx - last_pt) as Factor / mult as Factor,
        )
    } else {
        let start = idx / mult * mult;
        (
            [
                z_at(start - mult),
                z_at(start),
                z_at(start + mult),
                z_at(start + 2 * mult),
            ],
            (idx - start) as Factor / mult as Factor,
        )
    }
}

fn cardinal_spline(p: [Mm; 4], t: Factor, tension: Factor) -> Mm {
    let t2 = t * t;
    let t3 = t2 * t;
    let m1 = tension * (p[2] - p[0]);
    let m2 = tension * (p[3] - p[1]);
    let a = p[1] * (2.0 * t3 - 3.0 * t2 + 1.0);
    let b = p[2] * (-2.0 * t3 + 3.0 * t2);
    let c = m1 * (t3 - 2.0 * t2 + t);
    let d = m2 * (t3 - t2);
    a + b + c + d
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params(count: usize, pps: usize, algo: InterpolationAlgorithm) -> MeshParams {
        MeshParams {
            min_x: 0.0,
            max_x: 100.0,
            min_y: 0.0,
            max_y: 100.0,
            x_count: count,
            y_count: count,
            mesh_x_pps: pps,
            mesh_y_pps: pps,
            algo,
            tension: 0.2,
        }
    }

    fn bumpy(count: usize) -> ProbedMatrix {
        (0..count)
            .map(|j| {
                (0..count)
                    .map(|i| ((i * 7 + j * 3) % 5) as Mm * 0.05 - 0.1)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn flat_mesh_is_zero_everywhere() {
        let mesh = ZMesh::build(
            &params(3, 2, InterpolationAlgorithm::Lagrange),
            vec![vec![0.0; 3]; 3],
            "default",
        )
        .unwrap();
        assert_eq!(mesh.avg_z(), 0.0);
        for (x, y) in [(0.0, 0.0), (12.5, 77.0), (50.0, 50.0), (100.0, 100.0)] {
            assert_eq!(mesh.calc_z(x, y), 0.0);
        }
    }

    #[test]
    fn center_bump_with_small_grid_falls_back_to_lagrange() {
        let probed = vec![vec![0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]];
        let mesh = ZMesh::build(
            &params(3, 1, InterpolationAlgorithm::Bicubic),
            probed,
            "default",
        )
        .unwrap();
        assert_eq!(mesh.params().algo, InterpolationAlgorithm::Lagrange);
        assert_eq!(mesh.mesh_counts(), (5, 5));
        assert_eq!(mesh.calc_z(50.0, 50.0), 1.0);
        assert_eq!(mesh.calc_z(0.0, 0.0), 0.0);
        assert_eq!(mesh.calc_z(100.0, 100.0), 0.0);
    }

    #[test]
    fn interpolation_passes_through_probed_nodes() {
        for (count, algo) in [
            (3, InterpolationAlgorithm::Lagrange),
            (5, InterpolationAlgorithm::Lagrange),
            (4, InterpolationAlgorithm::Bicubic),
            (7, InterpolationAlgorithm::Bicubic),
        ] {
            let probed = bumpy(count);
            let mesh = ZMesh::build(&params(count, 3, algo), probed.clone(), "t").unwrap();
            let step = 100.0 / (count - 1) as Mm;
            for (j, row) in probed.iter().enumerate() {
                for (i, z) in row.iter().enumerate() {
                    let got = mesh.calc_z(i as Mm * step, j as Mm * step);
                    assert_relative_eq!(got, *z, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn sample_is_repeatable() {
        let mesh = ZMesh::build(
            &params(5, 2, InterpolationAlgorithm::Bicubic),
            bumpy(5),
            "t",
        )
        .unwrap();
        let a = mesh.calc_z(33.3, 71.9);
        let b = mesh.calc_z(33.3, 71.9);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn zero_pps_copies_probed_matrix() {
        let probed = bumpy(4);
        let mesh = ZMesh::build(
            &params(4, 0, InterpolationAlgorithm::Bicubic),
            probed.clone(),
            "t",
        )
        .unwrap();
        assert_eq!(mesh.params().algo, InterpolationAlgorithm::Direct);
        assert_eq!(mesh.mesh_counts(), (4, 4));
        // The reported matrix is rounded to 6 places.
        let dense = mesh.mesh_matrix();
        for (dense_row, probed_row) in dense.iter().zip(&probed) {
            assert_eq!(dense_row.len(), probed_row.len());
            for (d, p) in dense_row.iter().zip(probed_row) {
                assert_relative_eq!(*d, *p, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn lagrange_rejects_more_than_six_points() {
        let err = params(7, 2, InterpolationAlgorithm::Lagrange).resolved().unwrap_err();
        assert!(matches!(err, BedMeshError::Config(_)));
    }

    #[test]
    fn bicubic_with_three_by_seven_is_rejected() {
        let mut p = params(3, 2, InterpolationAlgorithm::Bicubic);
        p.y_count = 7;
        assert!(p.resolved().is_err());
        p.y_count = 6;
        assert_eq!(p.resolved().unwrap().algo, InterpolationAlgorithm::Lagrange);
    }

    #[test]
    fn outside_lookups_clamp_to_edge() {
        let probed = vec![vec![0.0, 0.0, 0.2], vec![0.0, 0.0, 0.2], vec![0.0, 0.0, 0.2]];
        let mesh = ZMesh::build(
            &params(3, 2, InterpolationAlgorithm::Lagrange),
            probed,
            "t",
        )
        .unwrap();
        assert_relative_eq!(mesh.calc_z(150.0, 50.0), 0.2, epsilon = 1e-12);
        assert_relative_eq!(mesh.calc_z(-40.0, -40.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn offsets_shift_lookup() {
        let probed = vec![vec![0.0, 0.5, 1.0]; 3];
        let mesh = ZMesh::build(
            &params(3, 0, InterpolationAlgorithm::Lagrange),
            probed,
            "t",
        )
        .unwrap();
        let shifted = mesh.with_offsets(Some(50.0), None);
        assert_relative_eq!(shifted.calc_z(0.0, 0.0), 0.5, epsilon = 1e-12);
        assert_eq!(shifted.offsets(), (50.0, 0.0));
        assert_eq!(mesh.offsets(), (0.0, 0.0));
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let err = ZMesh::build(
            &params(3, 2, InterpolationAlgorithm::Lagrange),
            vec![vec![0.0; 3]; 2],
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, BedMeshError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn average_is_rounded_to_hundredths() {
        let mesh = ZMesh::build(
            &params(3, 0, InterpolationAlgorithm::Lagrange),
            vec![vec![0.123, 0.123, 0.123]; 3],
            "t",
        )
        .unwrap();
        assert_eq!(mesh.avg_z(), 0.12);
    }

    #[test]
    fn mesh_report_lists_rows_top_down() {
        let probed = vec![vec![0.0; 3], vec![0.0; 3], vec![1.0; 3]];
        let mesh = ZMesh::build(
            &params(3, 0, InterpolationAlgorithm::Lagrange),
            probed,
            "t",
        )
        .unwrap();
        let report = mesh.mesh_report(None);
        let rows: Vec<&str> = report
            .lines()
            .skip_while(|l| *l != "Measured points:")
            .skip(1)
            .collect();
        assert_eq!(rows[0], "  1.000000  1.000000  1.000000");
        assert!(report.contains("Interpolation Algorithm: direct"));
    }
}
