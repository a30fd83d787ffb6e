//! G-code handling: tracking moves through a file so they can be rewritten
//! through the mesh, and parsing extended `NAME KEY=VALUE` commands.

use crate::error::{BedMeshError, MotionError, Result};
use crate::{BedMesh, Coord, Mm, Toolhead};
use regex::Regex;
use std::cell::RefCell;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::OnceLock;

// mm/min, used until the file sets a feedrate of its own.
const DEFAULT_FEEDRATE: Mm = 1500.0;
const AXIS_EPSILON: Mm = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcodeState {
    pub loc: Coord,
    pub is_abs_xyz: bool,
    pub is_abs_e: bool,
    // mm/min
    pub feedrate: Mm,
}

impl Default for GcodeState {
    fn default() -> Self {
        GcodeState {
            loc: Coord::default(),
            is_abs_xyz: true,
            is_abs_e: true,
            feedrate: DEFAULT_FEEDRATE,
        }
    }
}

impl GcodeState {
    /// G91 makes E relative along with XYZ.
    pub fn is_rel_e(&self) -> bool {
        !self.is_abs_xyz || !self.is_abs_e
    }
}

pub struct G1LineContext<'a> {
    pub line: &'a str,
    pub old_loc: Coord,
    pub g: &'a GcodeState,
    pub opt_f: Option<Mm>,
    pub opt_comment: Option<&'a str>,
}

pub struct GcodeLineHandler<'a> {
    pub g1_handler: &'a mut dyn FnMut(G1LineContext) -> Result<()>,
    /// Called after G92 redefined the position.
    pub position_handler: &'a mut dyn FnMut(&str, &GcodeState) -> Result<()>,
    pub default_handler: &'a mut dyn FnMut(&str) -> Result<()>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineCounts {
    pub lines: u64,
    pub moves: u64,
}

struct Patterns {
    g1_move: Regex,
    word: Regex,
    g90_abs: Regex,
    g91_rel: Regex,
    m82_abs_e: Regex,
    m83_rel_e: Regex,
    g92_set: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // strip off the G0/G1 and the comment; the first word may follow
        // without a space
        g1_move: Regex::new(r"(?i)^G0*[01](?<params>(?:\s|[XYZEF])[^;]*)?(?<comment>;.*)?$").expect("valid regex"),
        word: Regex::new(r"(?i)(?<axis>[XYZEF])(?<value>[-+]?(?:[0-9]+\.?[0-9]*|\.[0-9]+))").expect("valid regex"),
        g90_abs: Regex::new(r"(?i)^G90(?:[^0-9]|$)").expect("valid regex"),
        g91_rel: Regex::new(r"(?i)^G91(?:[^0-9]|$)").expect("valid regex"),
        m82_abs_e: Regex::new(r"(?i)^M82(?:[^0-9]|$)").expect("valid regex"),
        m83_rel_e: Regex::new(r"(?i)^M83(?:[^0-9]|$)").expect("valid regex"),
        g92_set: Regex::new(r"(?i)^G92(?<params>(?:\s|[XYZE])[^;]*)?(?:;.*)?$").expect("valid regex"),
    })
}

fn parse_value(line: &str, value: &str) -> Result<Mm> {
    value.parse().map_err(|e| BedMeshError::Parse {
        input: line.to_owned(),
        message: format!("bad number '{value}': {e}"),
    })
}

/// Feeds every line to `line_handler`, tracking the logical position and
/// the positioning modes along the way.
pub fn process_lines<R: BufRead>(reader: R, line_handler: &mut GcodeLineHandler) -> Result<LineCounts> {
    let p = patterns();
    let mut counts = LineCounts::default();
    let mut g = GcodeState::default();

    for line_result in reader.lines() {
        let line = line_result?;
        counts.lines += 1;
        let trimmed = line.trim();
        if let Some(g1_captures) = p.g1_move.captures(trimmed) {
            let old_loc = g.loc;
            let params = g1_captures.name("params").map_or("", |m| m.as_str());
            let opt_comment = g1_captures.name("comment").map(|m| m.as_str());
            let mut opt_f = None;
            for word in p.word.captures_iter(params) {
                let value = parse_value(&line, &word["value"])?;
                match word["axis"].to_ascii_uppercase().as_str() {
                    "X" if g.is_abs_xyz => g.loc.x = value,
                    "X" => g.loc.x += value,
                    "Y" if g.is_abs_xyz => g.loc.y = value,
                    "Y" => g.loc.y += value,
                    "Z" if g.is_abs_xyz => g.loc.z = value,
                    "Z" => g.loc.z += value,
                    "E" if g.is_rel_e() => g.loc.e += value,
                    "E" => g.loc.e = value,
                    _ => {
                        g.feedrate = value;
                        opt_f = Some(value);
                    }
                }
            }
            counts.moves += 1;
            let g1_line_context = G1LineContext {
                line: &line,
                old_loc,
                g: &g,
                opt_f,
                opt_comment,
            };
            (line_handler.g1_handler)(g1_line_context)?;
            continue;
        }
        if let Some(g92_captures) = p.g92_set.captures(trimmed) {
            let params = g92_captures.name("params").map_or("", |m| m.as_str());
            let mut any = false;
            for word in p.word.captures_iter(params) {
                let value = parse_value(&line, &word["value"])?;
                any = true;
                match word["axis"].to_ascii_uppercase().as_str() {
                    "X" => g.loc.x = value,
                    "Y" => g.loc.y = value,
                    "Z" => g.loc.z = value,
                    "E" => g.loc.e = value,
                    _ => {}
                }
            }
            if !any {
                g.loc = Coord::default();
            }
            (line_handler.position_handler)(&line, &g)?;
            continue;
        }
        (line_handler.default_handler)(&line)?;
        if p.m83_rel_e.is_match(trimmed) {
            g.is_abs_e = false;
        } else if p.m82_abs_e.is_match(trimmed) {
            g.is_abs_e = true;
        } else if p.g90_abs.is_match(trimmed) {
            g.is_abs_xyz = true;
        } else if p.g91_rel.is_match(trimmed) {
            g.is_abs_xyz = false;
        }
    }

    log::debug!("line_count: {} move_count: {}", counts.lines, counts.moves);
    Ok(counts)
}

/// A toolhead that writes its moves out as G-code.
pub struct GcodeWriter<W: Write> {
    out: W,
    position: Coord,
    feedrate: Option<Mm>,
    rel_e: bool,
    moves_written: u64,
}

impl<W: Write> GcodeWriter<W> {
    pub fn new(out: W) -> GcodeWriter<W> {
        GcodeWriter {
            out,
            position: Coord::default(),
            feedrate: None,
            rel_e: false,
            moves_written: 0,
        }
    }

    pub fn set_position(&mut self, pos: Coord) {
        self.position = pos;
    }

    pub fn set_relative_e(&mut self, rel_e: bool) {
        self.rel_e = rel_e;
    }

    pub fn moves_written(&self) -> u64 {
        self.moves_written
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{line}")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_move(&mut self, target: Coord, speed: Mm) -> io::Result<()> {
        let mut line = String::from("G1");
        let prev = self.position;
        if (target.x - prev.x).abs() > AXIS_EPSILON {
            line.push_str(&format!(" X{:.3}", target.x));
        }
        if (target.y - prev.y).abs() > AXIS_EPSILON {
            line.push_str(&format!(" Y{:.3}", target.y));
        }
        if (target.z - prev.z).abs() > AXIS_EPSILON {
            line.push_str(&format!(" Z{:.3}", target.z));
        }
        if (target.e - prev.e).abs() > AXIS_EPSILON {
            let e = if self.rel_e { target.e - prev.e } else { target.e };
            line.push_str(&format!(" E{e:.5}"));
        }
        let feedrate = speed * 60.0;
        if self.feedrate != Some(feedrate) {
            self.feedrate = Some(feedrate);
            line.push_str(&format!(" F{feedrate:.0}"));
        }
        self.position = target;
        if line.len() == 2 {
            return Ok(());
        }
        self.moves_written += 1;
        writeln!(self.out, "{line}")
    }
}

fn motion_error(e: io::Error) -> MotionError {
    MotionError::Other(format!("write failed: {e}"))
}

impl<W: Write> Toolhead for GcodeWriter<W> {
    fn move_to(&mut self, x: Option<Mm>, y: Option<Mm>, z: Option<Mm>, speed: Mm) -> std::result::Result<(), MotionError> {
        let target = Coord {
            x: x.unwrap_or(self.position.x),
            y: y.unwrap_or(self.position.y),
            z: z.unwrap_or(self.position.z),
            e: self.position.e,
        };
        self.write_move(target, speed).map_err(motion_error)
    }

    fn queue_move(&mut self, pos: Coord, speed: Mm) -> std::result::Result<(), MotionError> {
        self.write_move(pos, speed).map_err(motion_error)
    }

    fn get_position(&self) -> Coord {
        self.position
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub lines: u64,
    pub moves_in: u64,
    pub moves_out: u64,
}

/// Rewrites every move in `reader` through the active mesh of `bed_mesh`.
/// Other lines pass through unchanged.
pub fn apply_mesh<R: BufRead, W: Write>(bed_mesh: &mut BedMesh, reader: R, writer: W) -> Result<ApplyStats> {
    struct Rewriter<'b, W: Write> {
        bed_mesh: &'b mut BedMesh,
        out: GcodeWriter<W>,
    }

    let rewriter = RefCell::new(Rewriter {
        bed_mesh,
        out: GcodeWriter::new(writer),
    });
    rewriter.borrow_mut().bed_mesh.reset_position();

    let mut g1_handler = |c: G1LineContext| -> Result<()> {
        let mut r = rewriter.borrow_mut();
        let Rewriter { bed_mesh, out } = &mut *r;
        if let Some(comment) = c.opt_comment {
            out.write_line(comment)?;
        }
        out.set_relative_e(c.g.is_rel_e());
        bed_mesh.move_to(out, c.g.loc, c.g.feedrate / 60.0)
    };
    let mut position_handler = |line: &str, g: &GcodeState| -> Result<()> {
        let mut r = rewriter.borrow_mut();
        let Rewriter { bed_mesh, out } = &mut *r;
        out.write_line(line)?;
        // Only E is redefined in practice; the corrected Z is kept as is.
        let pos = out.get_position();
        out.set_position(Coord { x: g.loc.x, y: g.loc.y, e: g.loc.e, ..pos });
        bed_mesh.reset_position();
        Ok(())
    };
    let mut default_handler = |line: &str| -> Result<()> {
        rewriter.borrow_mut().out.write_line(line)?;
        Ok(())
    };

    let mut line_handler = GcodeLineHandler {
        g1_handler: &mut g1_handler,
        position_handler: &mut position_handler,
        default_handler: &mut default_handler,
    };
    let counts = process_lines(reader, &mut line_handler)?;

    let mut r = rewriter.into_inner();
    r.out.flush()?;
    Ok(ApplyStats {
        lines: counts.lines,
        moves_in: counts.moves,
        moves_out: r.out.moves_written(),
    })
}

/// A command of the form `NAME KEY=VALUE ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedCommand {
    name: String,
    params: Vec<(String, String)>,
}

impl ExtendedCommand {
    /// Returns `None` for blank lines, comments and classic `G1`/`M104`
    /// style commands.
    pub fn parse(line: &str) -> Result<Option<ExtendedCommand>> {
        static CLASSIC: OnceLock<Regex> = OnceLock::new();
        static NAME: OnceLock<Regex> = OnceLock::new();
        let classic = CLASSIC.get_or_init(|| Regex::new(r"^[A-Za-z][0-9.]+$").expect("valid regex"));
        let name_re = NAME.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

        let body = line.split([';', '#']).next().unwrap_or_default().trim();
        let mut words = body.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        if classic.is_match(name) {
            return Ok(None);
        }
        if !name_re.is_match(name) {
            return Err(BedMeshError::Parse {
                input: line.to_owned(),
                message: format!("malformed command name '{name}'"),
            });
        }
        let mut params = vec![];
        for word in words {
            let Some((key, value)) = word.split_once('=') else {
                return Err(BedMeshError::Parse {
                    input: line.to_owned(),
                    message: format!("malformed parameter '{word}', expected KEY=VALUE"),
                });
            };
            params.push((key.to_uppercase(), value.to_owned()));
        }
        Ok(Some(ExtendedCommand {
            name: name.to_uppercase(),
            params,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_float(&self, key: &str) -> Result<Option<Mm>> {
        self.get(key)
            .map(|v| {
                v.parse().map_err(|e| BedMeshError::Parse {
                    input: self.to_string(),
                    message: format!("{key}: {e}"),
                })
            })
            .transpose()
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.get(key)
            .map(|v| {
                v.parse().map_err(|e| BedMeshError::Parse {
                    input: self.to_string(),
                    message: format!("{key}: {e}"),
                })
            })
            .transpose()
    }
}

impl fmt::Display for ExtendedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.params {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_moves(text: &str) -> Vec<(Coord, bool)> {
        let mut moves = vec![];
        let mut g1_handler = |c: G1LineContext| -> Result<()> {
            moves.push((c.g.loc, c.g.is_rel_e()));
            Ok(())
        };
        let mut position_handler = |_: &str, _: &GcodeState| -> Result<()> { Ok(()) };
        let mut default_handler = |_: &str| -> Result<()> { Ok(()) };
        let mut handler = GcodeLineHandler {
            g1_handler: &mut g1_handler,
            position_handler: &mut position_handler,
            default_handler: &mut default_handler,
        };
        process_lines(text.as_bytes(), &mut handler).unwrap();
        moves
    }

    #[test]
    fn tracks_absolute_and_relative_moves() {
        let moves = collect_moves(
            "G90\nM83\nG1 X10 Y20 Z0.2 F3000\nG1 X20 E1.5 ; perimeter\nG91\nG1 X-5 Y5 E0.5\nG10\n",
        );
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[0].0, Coord::new(10.0, 20.0, 0.2, 0.0));
        assert_eq!(moves[1].0, Coord::new(20.0, 20.0, 0.2, 1.5));
        assert!(moves[1].1);
        assert_eq!(moves[2].0, Coord::new(15.0, 25.0, 0.2, 2.0));
    }

    #[test]
    fn compact_and_lowercase_moves_are_tracked() {
        let moves = collect_moves("g1 x10 y5\nG1X20E1.5\nG01 Z0.3\nG10\nG1\n");
        let locs: Vec<Coord> = moves.iter().map(|(loc, _)| *loc).collect();
        assert_eq!(
            locs,
            vec![
                Coord::new(10.0, 5.0, 0.0, 0.0),
                Coord::new(20.0, 5.0, 0.0, 1.5),
                Coord::new(20.0, 5.0, 0.3, 1.5),
                Coord::new(20.0, 5.0, 0.3, 1.5),
            ]
        );
    }

    #[test]
    fn absolute_e_and_g92_reset() {
        let mut positions = vec![];
        let mut g1_handler = |c: G1LineContext| -> Result<()> {
            positions.push(c.g.loc.e);
            Ok(())
        };
        let mut resets = 0;
        let mut position_handler = |_: &str, g: &GcodeState| -> Result<()> {
            resets += 1;
            assert_eq!(g.loc.e, 0.0);
            Ok(())
        };
        let mut default_handler = |_: &str| -> Result<()> { Ok(()) };
        let mut handler = GcodeLineHandler {
            g1_handler: &mut g1_handler,
            position_handler: &mut position_handler,
            default_handler: &mut default_handler,
        };
        let counts = process_lines("M82\nG1 X1 E3\nG92 E0\nG1 X2 E1\n".as_bytes(), &mut handler).unwrap();
        assert_eq!(counts, LineCounts { lines: 4, moves: 2 });
        assert_eq!(positions, vec![3.0, 1.0]);
        assert_eq!(resets, 1);
    }

    #[test]
    fn writer_emits_changed_axes_only() {
        let mut writer = GcodeWriter::new(Vec::new());
        writer.queue_move(Coord::new(10.0, 0.0, 0.0, 0.0), 50.0).unwrap();
        writer.queue_move(Coord::new(10.0, 5.0, 0.0, 0.0), 50.0).unwrap();
        writer.set_relative_e(true);
        writer.queue_move(Coord::new(10.0, 5.0, 0.0, 1.25), 25.0).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, "G1 X10.000 F3000\nG1 Y5.000\nG1 E1.25000 F1500\n");
    }

    #[test]
    fn extended_commands_parse() {
        let cmd = ExtendedCommand::parse("bed_mesh_profile save=pla ; keep").unwrap().unwrap();
        assert_eq!(cmd.name(), "BED_MESH_PROFILE");
        assert_eq!(cmd.get("SAVE"), Some("pla"));
        assert_eq!(cmd.to_string(), "BED_MESH_PROFILE SAVE=pla");
        let offset = ExtendedCommand::parse("BED_MESH_OFFSET X=1.5").unwrap().unwrap();
        assert_eq!(offset.get_float("X").unwrap(), Some(1.5));
        assert_eq!(offset.get_float("Y").unwrap(), None);
        assert!(ExtendedCommand::parse("G1 X10").unwrap().is_none());
        assert!(ExtendedCommand::parse("   ; comment").unwrap().is_none());
        assert!(ExtendedCommand::parse("BED_MESH_OUTPUT PGP").is_err());
        let pgp = ExtendedCommand::parse("BED_MESH_OUTPUT PGP=x").unwrap().unwrap();
        assert!(pgp.get_int("PGP").is_err());
    }
}
