//! Named meshes kept in the persisted configuration.
//!
//! Each profile is a `[bed_mesh <name>]` section holding a version tag, the
//! probed heights and the grid description. Changes are staged and only reach
//! the configuration text on `commit`.

use crate::configfile::{ConfigFile, ConfigSection};
use crate::error::{BedMeshError, Result};
use crate::mesh::{InterpolationAlgorithm, MeshParams, ProbedMatrix, ZMesh};
use crate::Mm;
use serde::Serialize;
use std::collections::BTreeMap;

pub const PROFILE_VERSION: u32 = 1;
pub const DEFAULT_PROFILE: &str = "default";
const SECTION_PREFIX: &str = "bed_mesh ";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub points: ProbedMatrix,
    pub mesh_params: MeshParams,
}

impl Profile {
    fn from_mesh(mesh: &ZMesh) -> Profile {
        Profile {
            points: mesh.probed_matrix().clone(),
            mesh_params: mesh.params().clone(),
        }
    }

    fn from_section(section: &ConfigSection) -> Result<Profile> {
        let raw = section.get("points").unwrap_or_default();
        let mut points: ProbedMatrix = vec![];
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let row = line
                .split(',')
                .map(|v| {
                    v.trim().parse::<Mm>().map_err(|e| BedMeshError::Parse {
                        input: line.to_owned(),
                        message: format!("profile '{}' points: {e}", section.name()),
                    })
                })
                .collect::<Result<Vec<Mm>>>()?;
            points.push(row);
        }
        let algo: String = section.parse("algo")?;
        let mesh_params = MeshParams {
            min_x: section.parse("min_x")?,
            max_x: section.parse("max_x")?,
            min_y: section.parse("min_y")?,
            max_y: section.parse("max_y")?,
            x_count: section.parse("x_count")?,
            y_count: section.parse("y_count")?,
            mesh_x_pps: section.parse("mesh_x_pps")?,
            mesh_y_pps: section.parse("mesh_y_pps")?,
            algo: algo.parse::<InterpolationAlgorithm>()?,
            tension: section.parse("tension")?,
        };
        Ok(Profile {
            points,
            mesh_params,
        })
    }

    fn write_section(&self, section: &mut ConfigSection) {
        let p = &self.mesh_params;
        section.set("version", &PROFILE_VERSION.to_string());
        let mut points = String::new();
        for row in &self.points {
            let row: Vec<String> = row.iter().map(|z| format!("{z:.6}")).collect();
            points.push('\n');
            points.push_str(&row.join(", "));
        }
        section.set("points", &points);
        section.set("min_x", &format_float(p.min_x));
        section.set("max_x", &format_float(p.max_x));
        section.set("min_y", &format_float(p.min_y));
        section.set("max_y", &format_float(p.max_y));
        section.set("x_count", &p.x_count.to_string());
        section.set("y_count", &p.y_count.to_string());
        section.set("mesh_x_pps", &p.mesh_x_pps.to_string());
        section.set("mesh_y_pps", &p.mesh_y_pps.to_string());
        section.set("algo", p.algo.as_str());
        section.set("tension", &format_float(p.tension));
    }
}

/// Shortest round-trip form, always with a fractional part.
pub fn format_float(v: Mm) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PendingChange {
    Save(String, Profile),
    Remove(String),
}

#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Profile>,
    incompatible: Vec<String>,
    pending: Vec<PendingChange>,
}

impl ProfileStore {
    pub fn from_config(file: &ConfigFile) -> Result<ProfileStore> {
        let mut store = ProfileStore::default();
        for section in file.sections_with_prefix(SECTION_PREFIX) {
            let name = section.name()[SECTION_PREFIX.len()..].trim().to_owned();
            let version: u32 = section.get("version").and_then(|v| v.trim().parse().ok()).unwrap_or(0);
            if version != PROFILE_VERSION {
                store.incompatible.push(name);
                continue;
            }
            let profile = Profile::from_section(section)?;
            store.profiles.insert(name, profile);
        }
        if !store.incompatible.is_empty() {
            log::warn!(
                "bed_mesh: Profile [{}] not compatible with this version of bed_mesh; \
                 remove and recalibrate it",
                store.incompatible.join(", ")
            );
        }
        Ok(store)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn list(&self) -> &BTreeMap<String, Profile> {
        &self.profiles
    }

    pub fn incompatible(&self) -> &[String] {
        &self.incompatible
    }

    /// Stores `mesh` under any name, `default` included.
    pub fn save(&mut self, name: &str, mesh: &ZMesh) {
        let profile = Profile::from_mesh(mesh);
        self.pending.push(PendingChange::Save(name.to_owned(), profile.clone()));
        self.profiles.insert(name.to_owned(), profile);
        log::info!("bed_mesh: profile [{name}] saved for the current session");
    }

    /// Operator facing save; the default profile is reserved for calibration.
    pub fn save_interactive(&mut self, name: &str, mesh: &ZMesh) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BedMeshError::Config("profile name must not be blank".into()));
        }
        if name == DEFAULT_PROFILE {
            return Err(BedMeshError::ReservedProfileName(name.to_owned()));
        }
        self.save(name, mesh);
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<ZMesh> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| BedMeshError::UnknownProfile(name.to_owned()))?;
        ZMesh::build(&profile.mesh_params, profile.points.clone(), name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.profiles.remove(name).is_none() {
            log::warn!("bed_mesh: no profile named [{name}] to remove");
            return false;
        }
        self.pending.push(PendingChange::Remove(name.to_owned()));
        true
    }

    /// Stages removal of every incompatible profile. Returns how many.
    pub fn check_incompatible(&mut self) -> usize {
        let count = self.incompatible.len();
        for name in self.incompatible.drain(..) {
            self.pending.push(PendingChange::Remove(name));
        }
        count
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies staged changes to the persisted configuration, in order.
    pub fn commit(&mut self, file: &mut ConfigFile) {
        for change in self.pending.drain(..) {
            match change {
                PendingChange::Save(name, profile) => {
                    let section_name = format!("{SECTION_PREFIX}{name}");
                    // Rewrite from scratch so the field order stays fixed.
                    file.remove_section(&section_name);
                    profile.write_section(file.section_mut(&section_name));
                }
                PendingChange::Remove(name) => {
                    file.remove_section(&format!("{SECTION_PREFIX}{name}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(name: &str) -> ZMesh {
        let params = MeshParams {
            min_x: 0.0,
            max_x: 100.0,
            min_y: 0.0,
            max_y: 100.0,
            x_count: 3,
            y_count: 3,
            mesh_x_pps: 2,
            mesh_y_pps: 2,
            algo: InterpolationAlgorithm::Lagrange,
            tension: 0.2,
        };
        let probed = vec![
            vec![0.1, 0.0125, -0.05],
            vec![0.0, 0.2, 0.0],
            vec![-0.1, 0.05, 0.3],
        ];
        ZMesh::build(&params, probed, name).unwrap()
    }

    const PERSISTED: &str = "\
[bed_mesh default]
version = 1
points =
\t  0.100000, 0.012500, -0.050000
\t  0.000000, 0.200000, 0.000000
\t  -0.100000, 0.050000, 0.300000
min_x = 0.0
max_x = 100.0
min_y = 0.0
max_y = 100.0
x_count = 3
y_count = 3
mesh_x_pps = 2
mesh_y_pps = 2
algo = lagrange
tension = 0.2
";

    #[test]
    fn commit_writes_the_fixed_layout() {
        let mut store = ProfileStore::default();
        store.save(DEFAULT_PROFILE, &mesh(DEFAULT_PROFILE));
        let mut file = ConfigFile::default();
        store.commit(&mut file);
        assert_eq!(file.render(), PERSISTED);
        assert!(!store.has_pending_changes());
    }

    #[test]
    fn save_then_load_reproduces_points_and_params() {
        let original = mesh("a");
        let mut store = ProfileStore::default();
        store.save_interactive("a", &original).unwrap();
        let mut file = ConfigFile::default();
        store.commit(&mut file);

        let reloaded = ProfileStore::from_config(&ConfigFile::parse(&file.render()).unwrap()).unwrap();
        let loaded = reloaded.load("a").unwrap();
        assert_eq!(loaded.probed_matrix(), original.probed_matrix());
        assert_eq!(loaded.params(), original.params());
    }

    #[test]
    fn interactive_save_rejects_reserved_name_without_mutating() {
        let mut store = ProfileStore::default();
        let err = store.save_interactive(DEFAULT_PROFILE, &mesh("x")).unwrap_err();
        assert!(matches!(err, BedMeshError::ReservedProfileName(_)));
        assert!(store.list().is_empty());
        assert!(!store.has_pending_changes());
        assert!(store.save_interactive("  ", &mesh("x")).is_err());
    }

    #[test]
    fn removal_is_staged_until_commit() {
        let mut file = ConfigFile::parse(PERSISTED).unwrap();
        let mut store = ProfileStore::from_config(&file).unwrap();
        assert!(store.remove(DEFAULT_PROFILE));
        assert!(!store.remove(DEFAULT_PROFILE));
        assert!(file.section("bed_mesh default").is_some());
        store.commit(&mut file);
        assert!(file.section("bed_mesh default").is_none());
    }

    #[test]
    fn incompatible_versions_are_not_loadable() {
        let text = PERSISTED.replace("version = 1", "version = 0");
        let mut file = ConfigFile::parse(&text).unwrap();
        let mut store = ProfileStore::from_config(&file).unwrap();
        assert_eq!(store.incompatible(), ["default".to_owned()]);
        assert!(matches!(
            store.load(DEFAULT_PROFILE),
            Err(BedMeshError::UnknownProfile(_))
        ));
        assert!(!store.has_pending_changes());
        assert_eq!(store.check_incompatible(), 1);
        store.commit(&mut file);
        assert!(file.sections().is_empty());
    }

    #[test]
    fn floats_format_like_the_persisted_file() {
        assert_eq!(format_float(100.0), "100.0");
        assert_eq!(format_float(-12.5), "-12.5");
        assert_eq!(format_float(0.2), "0.2");
    }
}
