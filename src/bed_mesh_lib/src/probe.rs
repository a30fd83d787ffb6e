//! Drives a measurement device over a list of XY points.

use crate::error::{BedMeshError, Result, SampleError};
use crate::{Mm, Toolhead};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The measurement capability. Implementations produce one height sample at
/// the current toolhead position, usually by driving a probing move of their
/// own and reporting where the trigger fired.
pub trait Probe {
    /// Called once before a batch of samples, e.g. to deploy a stowed probe.
    fn begin_session(&mut self) -> std::result::Result<(), SampleError> {
        Ok(())
    }

    /// Called once after a batch of samples, on success and failure alike.
    fn end_session(&mut self) -> std::result::Result<(), SampleError> {
        Ok(())
    }

    fn sample(&mut self) -> std::result::Result<Mm, SampleError>;

    /// Probe tip position relative to the nozzle: (x, y, z).
    fn offsets(&self) -> (Mm, Mm, Mm) {
        (0.0, 0.0, 0.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProbePoint {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.4})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplesResult {
    #[default]
    #[serde(alias = "mean")]
    Average,
    Median,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub samples: usize,
    pub samples_tolerance: Mm,
    pub samples_tolerance_retries: u32,
    pub samples_result: SamplesResult,
    pub sample_retract_dist: Mm,
    pub speed: Mm,
    pub lift_speed: Mm,
    pub horizontal_move_z: Mm,
    /// Travel so the probe, not the nozzle, lands on each point.
    pub use_xy_offsets: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            samples: 1,
            samples_tolerance: 0.1,
            samples_tolerance_retries: 0,
            samples_result: SamplesResult::Average,
            sample_retract_dist: 2.0,
            speed: 50.0,
            lift_speed: 50.0,
            horizontal_move_z: 5.0,
            use_xy_offsets: true,
        }
    }
}

/// Progress of a manual (operator confirmed) session.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualStep {
    /// Toolhead is parked over this point waiting for a confirmation.
    Point { index: usize, x: Mm, y: Mm },
    Done(Vec<ProbePoint>),
}

#[derive(Debug)]
struct ManualSession {
    points: Vec<(Mm, Mm)>,
    results: Vec<ProbePoint>,
    positioned: bool,
}

// Closes the device session on every exit path.
struct Session<'a> {
    probe: &'a mut dyn Probe,
    open: bool,
}

impl<'a> Session<'a> {
    fn begin(probe: &'a mut dyn Probe) -> Result<Session<'a>> {
        probe.begin_session()?;
        Ok(Session { probe, open: true })
    }

    fn finish(mut self) -> Result<()> {
        self.open = false;
        self.probe.end_session()?;
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.probe.end_session() {
                log::warn!("probe session cleanup failed: {e}");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ProbeOrchestrator {
    settings: ProbeSettings,
    manual: Option<ManualSession>,
}

impl ProbeOrchestrator {
    pub fn new(settings: ProbeSettings) -> ProbeOrchestrator {
        ProbeOrchestrator {
            settings,
            manual: None,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// True while a manual session is open.
    pub fn is_busy(&self) -> bool {
        self.manual.is_some()
    }

    /// Probes every point in order inside one device session and returns
    /// the toolhead XY plus the reduced height for each.
    pub fn visit(
        &mut self,
        points: &[(Mm, Mm)],
        probe: &mut dyn Probe,
        toolhead: &mut dyn Toolhead,
    ) -> Result<Vec<ProbePoint>> {
        if self.is_busy() {
            return Err(BedMeshError::ProbeBusy);
        }
        let offsets = if self.settings.use_xy_offsets {
            let (x, y, _) = probe.offsets();
            (x, y)
        } else {
            (0.0, 0.0)
        };
        let mut session = Session::begin(probe)?;
        let mut results = Vec::with_capacity(points.len());
        for (index, &(x, y)) in points.iter().enumerate() {
            let lift_speed = if index == 0 {
                self.settings.speed
            } else {
                self.settings.lift_speed
            };
            self.travel(toolhead, x - offsets.0, y - offsets.1, lift_speed)?;
            let pos = self.probe_point(&mut *session.probe, toolhead)?;
            log::debug!("probe at ({x:.3}, {y:.3}) is z={:.6}", pos.z);
            results.push(pos);
        }
        toolhead.move_to(None, None, Some(self.settings.horizontal_move_z), self.settings.lift_speed)?;
        session.finish()?;
        Ok(results)
    }

    /// Multi-sample probe at the current position, in a session of its own.
    pub fn run_probe(&mut self, probe: &mut dyn Probe, toolhead: &mut dyn Toolhead) -> Result<ProbePoint> {
        if self.is_busy() {
            return Err(BedMeshError::ProbeBusy);
        }
        let mut session = Session::begin(probe)?;
        let pos = self.probe_point(&mut *session.probe, toolhead)?;
        session.finish()?;
        Ok(pos)
    }

    fn travel(&self, toolhead: &mut dyn Toolhead, x: Mm, y: Mm, lift_speed: Mm) -> Result<()> {
        toolhead.move_to(None, None, Some(self.settings.horizontal_move_z), lift_speed)?;
        toolhead.move_to(Some(x), Some(y), None, self.settings.speed)?;
        Ok(())
    }

    fn probe_point(&self, probe: &mut dyn Probe, toolhead: &mut dyn Toolhead) -> Result<ProbePoint> {
        let s = &self.settings;
        let sample_count = s.samples.max(1);
        let start = toolhead.get_position();
        let mut retries = 0;
        let mut samples: Vec<ProbePoint> = Vec::with_capacity(sample_count);
        while samples.len() < sample_count {
            let z = probe.sample()?;
            samples.push(ProbePoint {
                x: start.x,
                y: start.y,
                z,
            });
            let spread = z_spread(&samples);
            if spread > s.samples_tolerance {
                if retries >= s.samples_tolerance_retries {
                    return Err(BedMeshError::ToleranceExceeded {
                        spread,
                        tolerance: s.samples_tolerance,
                        retries,
                    });
                }
                log::info!("Probe samples exceed tolerance. Retrying...");
                retries += 1;
                samples.clear();
            }
            if samples.len() < sample_count {
                toolhead.move_to(None, None, Some(z + s.sample_retract_dist), s.lift_speed)?;
            }
        }
        Ok(reduce_samples(&samples, s.samples_result))
    }

    pub fn start_manual(&mut self, points: Vec<(Mm, Mm)>) -> Result<()> {
        if self.is_busy() {
            return Err(BedMeshError::ProbeBusy);
        }
        self.manual = Some(ManualSession {
            results: Vec::with_capacity(points.len()),
            points,
            positioned: false,
        });
        Ok(())
    }

    /// Moves to the next point awaiting confirmation, or closes the session
    /// once every point is confirmed. Calling it again before `confirm`
    /// reports the same point without moving.
    pub fn advance(&mut self, toolhead: &mut dyn Toolhead) -> Result<ManualStep> {
        let session = self.manual.as_mut().ok_or(BedMeshError::ProbeAborted)?;
        let index = session.results.len();
        if index >= session.points.len() {
            toolhead.move_to(None, None, Some(self.settings.horizontal_move_z), self.settings.speed)?;
            let results = self
                .manual
                .take()
                .map(|session| session.results)
                .unwrap_or_default();
            return Ok(ManualStep::Done(results));
        }
        let (x, y) = session.points[index];
        if !session.positioned {
            session.positioned = true;
            let (z, speed) = (self.settings.horizontal_move_z, self.settings.speed);
            if let Err(e) = toolhead
                .move_to(None, None, Some(z), speed)
                .and_then(|_| toolhead.move_to(Some(x), Some(y), None, speed))
            {
                self.abort();
                return Err(e.into());
            }
        }
        Ok(ManualStep::Point { index, x, y })
    }

    /// Records the toolhead position as the result for the pending point.
    pub fn confirm(&mut self, toolhead: &dyn Toolhead) -> Result<()> {
        let session = self.manual.as_mut().ok_or(BedMeshError::ProbeAborted)?;
        if !session.positioned {
            return Err(BedMeshError::Config(
                "manual probe confirmed before moving to a point".into(),
            ));
        }
        let pos = toolhead.get_position();
        session.results.push(ProbePoint {
            x: pos.x,
            y: pos.y,
            z: pos.z,
        });
        session.positioned = false;
        Ok(())
    }

    /// Drops the manual session and anything it collected.
    pub fn abort(&mut self) {
        if let Some(session) = self.manual.take() {
            log::info!(
                "manual probe aborted after {} of {} points",
                session.results.len(),
                session.points.len()
            );
        }
    }
}

fn z_spread(samples: &[ProbePoint]) -> Mm {
    let (lo, hi) = samples
        .iter()
        .fold((Mm::INFINITY, Mm::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.z), hi.max(p.z))
        });
    hi - lo
}

fn mean(samples: &[ProbePoint]) -> ProbePoint {
    let count = samples.len() as Mm;
    let sum = samples.iter().fold(ProbePoint::default(), |acc, p| ProbePoint {
        x: acc.x + p.x,
        y: acc.y + p.y,
        z: acc.z + p.z,
    });
    ProbePoint {
        x: sum.x / count,
        y: sum.y / count,
        z: sum.z / count,
    }
}

pub fn reduce_samples(samples: &[ProbePoint], mode: SamplesResult) -> ProbePoint {
    match mode {
        SamplesResult::Average => mean(samples),
        SamplesResult::Median => {
            let mut sorted = samples.to_vec();
            sorted.sort_by_key(|p| OrderedFloat(p.z));
            let middle = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                sorted[middle]
            } else {
                mean(&sorted[middle - 1..middle + 1])
            }
        }
    }
}
