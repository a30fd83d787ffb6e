use anyhow::{bail, Context, Result};
use bed_mesh_lib as bm;
use bm::sim::{sim_machine, SimOptions};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(author, version, about = "Bed mesh calibration and G-code compensation")]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true, default_value = "bed_mesh.json")]
    config: PathBuf,

    /// Persisted machine configuration holding the stored profiles
    #[arg(long, global = true, default_value = "printer.cfg")]
    profiles: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a simulated bed and store the result as a profile
    Calibrate {
        #[arg(long)]
        profile: Option<String>,
        #[command(flatten)]
        sim: SimArgs,
    },
    /// Rewrite a G-code file through a stored mesh
    Apply {
        input: PathBuf,
        /// Written via a temporary file; may equal the input
        output: PathBuf,
        /// Profile to load, instead of the auto-loaded default
        #[arg(long)]
        profile: Option<String>,
    },
    /// Print the active mesh, or the generated probe points
    Output {
        #[arg(long)]
        pgp: bool,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Print the active mesh as JSON
    Map {
        #[arg(long)]
        profile: Option<String>,
    },
    /// Manage stored profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Read extended commands from stdin against a simulated machine
    Console {
        #[command(flatten)]
        sim: SimArgs,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    List,
    Remove { name: String },
    /// Drop every profile with an outdated version tag
    Prune,
}

#[derive(Clone, Copy, ValueEnum)]
enum SurfaceKind {
    Flat,
    Tilt,
    Bowl,
}

#[derive(clap::Args)]
struct SimArgs {
    #[arg(long, value_enum, default_value_t = SurfaceKind::Tilt)]
    surface: SurfaceKind,
    /// Peak probe noise
    #[arg(long, default_value_t = 0.0)]
    noise: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl SimArgs {
    fn machine(&self, config: &bm::BedMeshConfig) -> (bm::sim::SimToolhead, bm::sim::SimProbe) {
        let options = SimOptions {
            probe_offsets: config.probe_offsets(),
            noise: self.noise,
            seed: self.seed,
            ..SimOptions::default()
        };
        match self.surface {
            SurfaceKind::Flat => sim_machine(|_, _| 0.0, options),
            SurfaceKind::Tilt => sim_machine(|x, y| 0.002 * x - 0.001 * y, options),
            SurfaceKind::Bowl => sim_machine(
                |x, y| {
                    let (dx, dy) = (x - 110.0, y - 110.0);
                    (dx * dx + dy * dy) * 1e-5 - 0.1
                },
                options,
            ),
        }
    }
}

fn read_profiles(path: &Path) -> Result<bm::ConfigFile> {
    if !path.exists() {
        log::info!("{} does not exist yet, starting without profiles", path.display());
        return Ok(bm::ConfigFile::default());
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(bm::ConfigFile::parse(&text)?)
}

fn commit_profiles(bed_mesh: &mut bm::BedMesh, file: &mut bm::ConfigFile, path: &Path) -> Result<()> {
    if bed_mesh.commit_profiles(file) {
        write_atomically(path, file.render().as_bytes())?;
        println!("profiles written to {}", path.display());
    }
    Ok(())
}

// Output can be the same file as the input; replace it only once complete.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn load_requested(bed_mesh: &mut bm::BedMesh, profile: Option<&str>) -> Result<()> {
    if let Some(name) = profile {
        bed_mesh
            .load_profile(name)
            .with_context(|| format!("loading profile {name}"))?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = bm::config::load_config(&cli.config)?;
    let mut persisted = read_profiles(&cli.profiles)?;
    let mut bed_mesh = bm::BedMesh::new(&config, &persisted)?;

    match cli.command {
        Command::Calibrate { profile, sim } => {
            let (mut toolhead, mut probe) = sim.machine(&config);
            let before = Instant::now();
            bed_mesh.calibrate(profile.as_deref(), &mut probe, &mut toolhead)?;
            println!("calibrated in {:.2?}", before.elapsed());
            println!("{}", bed_mesh.output(false));
            commit_profiles(&mut bed_mesh, &mut persisted, &cli.profiles)?;
        }
        Command::Apply {
            input,
            output,
            profile,
        } => {
            load_requested(&mut bed_mesh, profile.as_deref())?;
            if bed_mesh.mesh().is_none() {
                bail!("no mesh to apply; calibrate first or pass --profile");
            }
            let reader = io::BufReader::with_capacity(
                64 * 1024,
                fs::File::open(&input).with_context(|| format!("opening {}", input.display()))?,
            );
            let mut rewritten = Vec::new();
            let before = Instant::now();
            let stats = bm::gcode::apply_mesh(&mut bed_mesh, reader, &mut rewritten)?;
            write_atomically(&output, &rewritten)?;
            println!(
                "lines: {} moves in: {} moves out: {} elapsed: {:.2?}",
                stats.lines,
                stats.moves_in,
                stats.moves_out,
                before.elapsed()
            );
        }
        Command::Output { pgp, profile } => {
            load_requested(&mut bed_mesh, profile.as_deref())?;
            println!("{}", bed_mesh.output(pgp));
        }
        Command::Map { profile } => {
            load_requested(&mut bed_mesh, profile.as_deref())?;
            println!("{}", bed_mesh.map()?);
        }
        Command::Profile { action } => {
            match action {
                ProfileAction::List => {
                    for (name, profile) in bed_mesh.profiles().list() {
                        let p = &profile.mesh_params;
                        println!(
                            "{name}: {}x{} {} ({}, {}) .. ({}, {})",
                            p.x_count, p.y_count, p.algo, p.min_x, p.min_y, p.max_x, p.max_y
                        );
                    }
                    for name in bed_mesh.profiles().incompatible() {
                        println!("{name}: incompatible version");
                    }
                }
                ProfileAction::Remove { name } => {
                    if !bed_mesh.remove_profile(&name) {
                        bail!("no profile named [{name}]");
                    }
                }
                ProfileAction::Prune => {
                    let count = bed_mesh.prune_incompatible_profiles();
                    println!("{count} incompatible profile(s) removed");
                }
            }
            commit_profiles(&mut bed_mesh, &mut persisted, &cli.profiles)?;
        }
        Command::Console { sim } => {
            let (mut toolhead, mut probe) = sim.machine(&config);
            for line in io::stdin().lock().lines() {
                let line = line?;
                let cmd = match bm::ExtendedCommand::parse(&line) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => continue,
                    Err(e) => {
                        eprintln!("!! {e}");
                        continue;
                    }
                };
                if cmd.name() == "SAVE_CONFIG" {
                    commit_profiles(&mut bed_mesh, &mut persisted, &cli.profiles)?;
                    continue;
                }
                match bed_mesh.run_command(&cmd, &mut probe, &mut toolhead) {
                    Ok(response) if response.is_empty() => {}
                    Ok(response) => println!("{response}"),
                    Err(e) => eprintln!("!! {e}"),
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Cli::parse())
}
