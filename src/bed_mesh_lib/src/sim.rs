//! Stand-in machines: a recording toolhead and scripted probe for tests, and
//! a simulated bed whose toolhead and probe share one position.

use crate::error::{MotionError, SampleError};
use crate::probe::Probe;
use crate::{Coord, Mm, Toolhead};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Records every queued move and applies direct moves to `position`.
#[derive(Debug, Default)]
pub struct RecordingToolhead {
    pub moves: Vec<Coord>,
    pub position: Coord,
    pub manual_moves: usize,
}

impl Toolhead for RecordingToolhead {
    fn move_to(&mut self, x: Option<Mm>, y: Option<Mm>, z: Option<Mm>, _speed: Mm) -> Result<(), MotionError> {
        if let Some(x) = x {
            self.position.x = x;
        }
        if let Some(y) = y {
            self.position.y = y;
        }
        if let Some(z) = z {
            self.position.z = z;
        }
        self.manual_moves += 1;
        Ok(())
    }

    fn queue_move(&mut self, pos: Coord, _speed: Mm) -> Result<(), MotionError> {
        self.moves.push(pos);
        Ok(())
    }

    fn get_position(&self) -> Coord {
        self.position
    }
}

/// Returns the given heights in order, then times out.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    heights: VecDeque<Mm>,
    offsets: (Mm, Mm, Mm),
    pub sessions_begun: usize,
    pub sessions_ended: usize,
}

impl ScriptedProbe {
    pub fn new(heights: &[Mm]) -> ScriptedProbe {
        ScriptedProbe {
            heights: heights.iter().copied().collect(),
            ..ScriptedProbe::default()
        }
    }

    pub fn with_offsets(mut self, offsets: (Mm, Mm, Mm)) -> ScriptedProbe {
        self.offsets = offsets;
        self
    }
}

impl Probe for ScriptedProbe {
    fn begin_session(&mut self) -> Result<(), SampleError> {
        self.sessions_begun += 1;
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), SampleError> {
        self.sessions_ended += 1;
        Ok(())
    }

    fn sample(&mut self) -> Result<Mm, SampleError> {
        self.heights.pop_front().ok_or(SampleError::Timeout)
    }

    fn offsets(&self) -> (Mm, Mm, Mm) {
        self.offsets
    }
}

pub type Surface = Box<dyn Fn(Mm, Mm) -> Mm>;

#[derive(Debug)]
struct SimState {
    position: Coord,
    limits: ((Mm, Mm), (Mm, Mm)),
    probe_deployed: bool,
}

/// Options for `sim_machine`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOptions {
    pub probe_offsets: (Mm, Mm, Mm),
    /// Peak uniform noise added to every sample.
    pub noise: Mm,
    pub seed: u64,
    /// Travel limits, (min, max).
    pub limits: ((Mm, Mm), (Mm, Mm)),
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            probe_offsets: (0.0, 0.0, 0.0),
            noise: 0.0,
            seed: 0,
            limits: ((-1000.0, -1000.0), (1000.0, 1000.0)),
        }
    }
}

pub struct SimToolhead {
    state: Rc<RefCell<SimState>>,
}

impl Toolhead for SimToolhead {
    fn move_to(&mut self, x: Option<Mm>, y: Option<Mm>, z: Option<Mm>, _speed: Mm) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        let target = Coord {
            x: x.unwrap_or(state.position.x),
            y: y.unwrap_or(state.position.y),
            z: z.unwrap_or(state.position.z),
            e: state.position.e,
        };
        let ((min_x, min_y), (max_x, max_y)) = state.limits;
        if !(min_x..=max_x).contains(&target.x) || !(min_y..=max_y).contains(&target.y) {
            return Err(MotionError::OutOfRange {
                x: target.x,
                y: target.y,
                z: target.z,
            });
        }
        state.position = target;
        Ok(())
    }

    fn queue_move(&mut self, pos: Coord, speed: Mm) -> Result<(), MotionError> {
        self.move_to(Some(pos.x), Some(pos.y), Some(pos.z), speed)?;
        self.state.borrow_mut().position.e = pos.e;
        Ok(())
    }

    fn get_position(&self) -> Coord {
        self.state.borrow().position
    }
}

/// Triggers at the surface height under the probe tip.
pub struct SimProbe {
    state: Rc<RefCell<SimState>>,
    surface: Surface,
    offsets: (Mm, Mm, Mm),
    noise: Mm,
    rng: StdRng,
}

impl Probe for SimProbe {
    fn begin_session(&mut self) -> Result<(), SampleError> {
        self.state.borrow_mut().probe_deployed = true;
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), SampleError> {
        self.state.borrow_mut().probe_deployed = false;
        Ok(())
    }

    fn sample(&mut self) -> Result<Mm, SampleError> {
        let mut state = self.state.borrow_mut();
        if !state.probe_deployed {
            return Err(SampleError::Device("probe is not deployed".into()));
        }
        let (x_off, y_off, z_off) = self.offsets;
        let bed_z = (self.surface)(state.position.x + x_off, state.position.y + y_off);
        if bed_z >= state.position.z {
            return Err(SampleError::TriggeredEarly);
        }
        let noise = if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        // The toolhead stops where the probe fired.
        let z = bed_z + z_off + noise;
        state.position.z = z;
        Ok(z)
    }

    fn offsets(&self) -> (Mm, Mm, Mm) {
        self.offsets
    }
}

/// Builds a toolhead and probe over `surface` that share one position.
pub fn sim_machine(surface: impl Fn(Mm, Mm) -> Mm + 'static, options: SimOptions) -> (SimToolhead, SimProbe) {
    let state = Rc::new(RefCell::new(SimState {
        position: Coord {
            z: 10.0,
            ..Coord::default()
        },
        limits: options.limits,
        probe_deployed: false,
    }));
    let toolhead = SimToolhead {
        state: Rc::clone(&state),
    };
    let probe = SimProbe {
        state,
        surface: Box::new(surface),
        offsets: options.probe_offsets,
        noise: options.noise,
        rng: StdRng::seed_from_u64(options.seed),
    };
    (toolhead, probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sim_probe_reads_surface_under_the_tip() {
        let options = SimOptions {
            probe_offsets: (10.0, 0.0, 0.5),
            ..SimOptions::default()
        };
        let (mut toolhead, mut probe) = sim_machine(|x, _| x / 100.0, options);
        assert!(matches!(probe.sample(), Err(SampleError::Device(_))));
        probe.begin_session().unwrap();
        toolhead.move_to(Some(40.0), Some(0.0), Some(5.0), 50.0).unwrap();
        let z = probe.sample().unwrap();
        assert_relative_eq!(z, 0.5 + 0.5, epsilon = 1e-12);
        assert_relative_eq!(toolhead.get_position().z, z, epsilon = 1e-12);
    }

    #[test]
    fn sim_toolhead_enforces_limits() {
        let options = SimOptions {
            limits: ((0.0, 0.0), (200.0, 200.0)),
            ..SimOptions::default()
        };
        let (mut toolhead, _) = sim_machine(|_, _| 0.0, options);
        assert!(matches!(
            toolhead.move_to(Some(-5.0), None, None, 50.0),
            Err(MotionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn noise_stays_within_bounds() {
        let options = SimOptions {
            noise: 0.01,
            seed: 7,
            ..SimOptions::default()
        };
        let (mut toolhead, mut probe) = sim_machine(|_, _| 0.0, options);
        probe.begin_session().unwrap();
        for _ in 0..20 {
            toolhead.move_to(None, None, Some(2.0), 50.0).unwrap();
            let z = probe.sample().unwrap();
            assert!(z.abs() <= 0.01);
        }
    }
}
