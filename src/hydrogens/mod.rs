//! Hydrogen completion for ligands read from molfiles
//!
//! Docking programs often write heavy-atom-only poses. Every heavy atom receives
//! the hydrogens its lowest fitting valence leaves open, placed at ideal X-H
//! bond lengths in tetrahedral, trigonal or linear geometry around the bonds it
//! already has. Hydrogens are appended after the existing atoms.

use log::{debug, warn};
use nalgebra::{Rotation3, Unit, Vector3};
use std::path::Path;

use crate::atom::{Atom, RecordKind};
use crate::io::{self, BondOrder, IoError, Molfile};
use crate::structure::Structure;

/// cos(109.47 deg), the tetrahedral angle
const COS_TETRAHEDRAL: f64 = -1.0 / 3.0;

/// Half of the H-X-H angle of a tetrahedral CH2 group, in degrees
const HALF_TETRAHEDRAL_DEG: f64 = 54.75;

/// Electron domains around an atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Linear,
    Trigonal,
    Tetrahedral,
}

impl Geometry {
    fn domains(&self) -> usize {
        match self {
            Geometry::Linear => 2,
            Geometry::Trigonal => 3,
            Geometry::Tetrahedral => 4,
        }
    }

    /// Ideal directions for an atom without bonds
    fn free_directions(&self) -> Vec<Vector3<f64>> {
        let raw = match self {
            Geometry::Linear => vec![Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)],
            Geometry::Trigonal => vec![
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(-0.5, 0.75f64.sqrt(), 0.0),
                Vector3::new(-0.5, -(0.75f64.sqrt()), 0.0),
            ],
            Geometry::Tetrahedral => vec![
                Vector3::new(1.0, 1.0, 1.0),
                Vector3::new(1.0, -1.0, -1.0),
                Vector3::new(-1.0, 1.0, -1.0),
                Vector3::new(-1.0, -1.0, 1.0),
            ],
        };
        raw.into_iter().map(|v| v.normalize()).collect()
    }
}

/// Valences an element may take at a formal charge, lowest first
///
/// Elements without an entry never receive hydrogens.
fn allowed_valences(element: &str, charge: i32) -> Vec<u32> {
    let base: &[i32] = match element.to_ascii_uppercase().as_str() {
        "C" => return valid(&[4 - charge.abs()]),
        "B" => return valid(&[3 - charge]),
        "N" => &[3],
        "O" => &[2],
        "S" => &[2, 4, 6],
        "P" => &[3, 5],
        "F" | "CL" | "BR" | "I" => {
            return if charge == 0 { vec![1] } else { Vec::new() };
        }
        _ => return Vec::new(),
    };
    valid(&base.iter().map(|v| v + charge).collect::<Vec<_>>())
}

fn valid(values: &[i32]) -> Vec<u32> {
    values.iter().filter(|&&v| v >= 0).map(|&v| v as u32).collect()
}

/// Ideal X-H bond length in Angstroms
fn bond_length(element: &str) -> f64 {
    match element.to_ascii_uppercase().as_str() {
        "C" => 1.09,
        "N" => 1.01,
        "O" => 0.96,
        "S" => 1.34,
        "P" => 1.42,
        "B" => 1.19,
        "F" => 0.92,
        "CL" => 1.27,
        "BR" => 1.41,
        "I" => 1.61,
        _ => 1.0,
    }
}

fn is_hydrogen_element(element: &str) -> bool {
    element.eq_ignore_ascii_case("H") || element.eq_ignore_ascii_case("D")
}

/// Number of hydrogens missing on every atom of a molfile
pub fn implicit_hydrogens(molfile: &Molfile) -> Vec<usize> {
    let atoms = &molfile.structure.atoms;
    let mut bonded = vec![0.0f64; atoms.len()];
    for bond in &molfile.bonds {
        bonded[bond.first] += bond.order.valence();
        bonded[bond.second] += bond.order.valence();
    }

    atoms
        .iter()
        .enumerate()
        .map(|(i, atom)| {
            if is_hydrogen_element(&atom.element) {
                return 0;
            }
            let charge = molfile.charges.get(i).copied().unwrap_or(0);
            // Aromatic bonds count 1.5; a ring fusion carbon (4.5) is saturated
            let used = bonded[i].floor() as u32;
            match allowed_valences(&atom.element, charge).into_iter().find(|&v| v >= used) {
                Some(valence) => (valence - used) as usize,
                None => {
                    if !allowed_valences(&atom.element, charge).is_empty() {
                        debug!("{} exceeds its usual valence; no hydrogens added", atom.name);
                    }
                    0
                }
            }
        })
        .collect()
}

fn geometry_of(orders: &[BondOrder]) -> Geometry {
    let doubles = orders.iter().filter(|o| **o == BondOrder::Double).count();
    if orders.contains(&BondOrder::Triple) || doubles >= 2 {
        Geometry::Linear
    } else if doubles == 1 || orders.contains(&BondOrder::Aromatic) {
        Geometry::Trigonal
    } else {
        Geometry::Tetrahedral
    }
}

/// Any unit vector perpendicular to `v`
fn perpendicular(v: &Vector3<f64>) -> Vector3<f64> {
    let helper = if v.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    (helper - v * v.dot(&helper)).normalize()
}

/// Unit direction of `v`, or `fallback` when `v` vanishes
fn unit_or(v: Vector3<f64>, fallback: Vector3<f64>) -> Vector3<f64> {
    v.try_normalize(1e-6).unwrap_or(fallback)
}

/// Directions of new hydrogens around an atom
///
/// `bonds` are unit vectors towards the existing neighbours. `reference`, when
/// given, is a unit vector perpendicular to a single bond that fixes the
/// rotation of the new hydrogens about it.
pub fn hydrogen_directions(
    bonds: &[Vector3<f64>],
    reference: Option<Vector3<f64>>,
    geometry: Geometry,
    count: usize,
) -> Vec<Vector3<f64>> {
    let sum: Vector3<f64> = bonds.iter().sum();

    let directions = match (geometry, bonds.len()) {
        (_, 0) => geometry.free_directions(),
        (Geometry::Trigonal, 1) => {
            let axis = bonds[0];
            let p = reference.unwrap_or_else(|| perpendicular(&axis));
            let sin = 0.75f64.sqrt();
            vec![-axis * 0.5 + p * sin, -axis * 0.5 - p * sin]
        }
        (Geometry::Tetrahedral, 1) => {
            let axis = bonds[0];
            // Staggered against the reference substituent
            let p = -reference.unwrap_or_else(|| perpendicular(&axis));
            let first = axis * COS_TETRAHEDRAL + p * (1.0 - COS_TETRAHEDRAL * COS_TETRAHEDRAL).sqrt();
            let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(axis), 120f64.to_radians());
            let second = rotation * first;
            let third = rotation * second;
            vec![first, second, third]
        }
        (Geometry::Tetrahedral, 2) => {
            let bisector = unit_or(-sum, perpendicular(&bonds[0]));
            let normal = unit_or(bonds[0].cross(&bonds[1]), perpendicular(&bisector));
            let half = HALF_TETRAHEDRAL_DEG.to_radians();
            vec![
                bisector * half.cos() + normal * half.sin(),
                bisector * half.cos() - normal * half.sin(),
            ]
        }
        _ => vec![unit_or(-sum, perpendicular(&bonds[0]))],
    };

    if count > directions.len() {
        warn!(
            "{} hydrogens requested but {:?} geometry with {} bonds leaves room for {}",
            count,
            geometry,
            bonds.len(),
            directions.len()
        );
    }
    directions.into_iter().take(count).collect()
}

/// Ligand structure with every open valence filled by a placed hydrogen
pub fn add_hydrogens(molfile: &Molfile) -> Structure {
    let mut structure = molfile.structure.clone();
    let atoms = &molfile.structure.atoms;
    let missing = implicit_hydrogens(molfile);

    let mut neighbours: Vec<Vec<(usize, BondOrder)>> = vec![Vec::new(); atoms.len()];
    for bond in &molfile.bonds {
        neighbours[bond.first].push((bond.second, bond.order));
        neighbours[bond.second].push((bond.first, bond.order));
    }

    let mut hydrogen_count = atoms.iter().filter(|a| is_hydrogen_element(&a.element)).count();
    let mut added = 0;

    for (i, atom) in atoms.iter().enumerate() {
        if missing[i] == 0 {
            continue;
        }
        let centre = atom.coordinates;
        let bonds: Vec<Vector3<f64>> = neighbours[i]
            .iter()
            .filter_map(|(j, _)| (atoms[*j].coordinates - centre).try_normalize(1e-6))
            .collect();
        let orders: Vec<BondOrder> = neighbours[i].iter().map(|(_, o)| *o).collect();

        let reference = match neighbours[i].as_slice() {
            [(j, _)] => neighbours[*j]
                .iter()
                .find(|(k, _)| *k != i)
                .and_then(|(k, _)| {
                    let axis = bonds.first()?;
                    let r = atoms[*k].coordinates - atoms[*j].coordinates;
                    (r - axis * axis.dot(&r)).try_normalize(1e-6)
                }),
            _ => None,
        };

        let length = bond_length(&atom.element);
        for direction in hydrogen_directions(&bonds, reference, geometry_of(&orders), missing[i]) {
            hydrogen_count += 1;
            added += 1;
            let serial = structure.len() as u32 + 1;
            structure.add_atom(Atom::new(
                RecordKind::Hetero,
                serial,
                format!("H{}", hydrogen_count),
                atom.residue_name.clone(),
                atom.chain_id,
                atom.residue_num,
                centre + direction * length,
                "H".to_string(),
            ));
        }
    }

    if added > 0 {
        debug!("Added {} hydrogens to {}", added, structure.name);
    }
    structure
}

/// Read a ligand for evaluation
///
/// Molfiles are completed with hydrogens from their bond table. PDB ligands
/// carry no bond orders and are used as given.
pub fn read_ligand<P: AsRef<Path>>(path: P) -> Result<Structure, IoError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let ligand = match extension.as_str() {
        "sdf" | "mol" => add_hydrogens(&io::parse_molfile(path)?),
        _ => io::read_structure(path)?,
    };

    if !ligand.atoms.iter().any(|a| a.is_hydrogen()) && ligand.len() > 1 {
        warn!(
            "Ligand {} has no hydrogens; energies will describe the bare heavy-atom graph",
            path.display()
        );
    }
    Ok(ligand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_molfile;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Cursor;

    const HEAVY_ETHANOL: &str = "\
ethanol
  heavy atoms only

  3  2  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    1.5200    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    2.0300    1.3400    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0
  2  3  1  0
M  END
$$$$
";

    fn heavy_ethanol() -> Molfile {
        read_molfile(Cursor::new(HEAVY_ETHANOL), "ethanol").unwrap()
    }

    fn hydrogens_of(structure: &Structure, heavy: usize) -> Vec<&Atom> {
        let centre = &structure.atoms[heavy];
        structure
            .atoms
            .iter()
            .filter(|a| a.is_hydrogen() && a.distance(centre) < 1.2)
            .collect()
    }

    #[test]
    fn test_counts_for_heavy_ethanol() {
        assert_eq!(implicit_hydrogens(&heavy_ethanol()), vec![3, 2, 1]);
    }

    #[test]
    fn test_heavy_ethanol_is_completed() {
        let molfile = heavy_ethanol();
        let completed = add_hydrogens(&molfile);
        assert_eq!(completed.len(), 9);
        assert_eq!(completed.atoms[3].name, "H1");
        assert_eq!(completed.atoms[8].name, "H6");
        assert!(completed.atoms[3..].iter().all(|a| a.residue_name == "UNL"));

        assert_eq!(hydrogens_of(&completed, 0).len(), 3);
        assert_eq!(hydrogens_of(&completed, 1).len(), 2);
        assert_eq!(hydrogens_of(&completed, 2).len(), 1);
        for h in hydrogens_of(&completed, 0) {
            assert_approx_eq!(h.distance(&completed.atoms[0]), 1.09);
        }
    }

    #[test]
    fn test_methyl_hydrogens_are_tetrahedral() {
        let completed = add_hydrogens(&heavy_ethanol());
        let carbon = completed.atoms[0].coordinates;
        let neighbour = completed.atoms[1].coordinates;
        let hydrogens = hydrogens_of(&completed, 0);

        for h in &hydrogens {
            let to_h = (h.coordinates - carbon).normalize();
            let to_c = (neighbour - carbon).normalize();
            assert_approx_eq!(to_h.dot(&to_c), COS_TETRAHEDRAL, 1e-6);
        }
        // No two hydrogens share a position
        for (i, a) in hydrogens.iter().enumerate() {
            for b in &hydrogens[i + 1..] {
                assert!(a.distance(b) > 1.5);
            }
        }
    }

    #[test]
    fn test_complete_ligand_is_unchanged() {
        let text = "\
methane
  complete

  5  4  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    0.6291    0.6291    0.6291 H   0  0  0  0  0  0  0  0  0  0  0  0
   -0.6291   -0.6291    0.6291 H   0  0  0  0  0  0  0  0  0  0  0  0
   -0.6291    0.6291   -0.6291 H   0  0  0  0  0  0  0  0  0  0  0  0
    0.6291   -0.6291   -0.6291 H   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0
  1  3  1  0
  1  4  1  0
  1  5  1  0
M  END
";
        let molfile = read_molfile(Cursor::new(text), "methane").unwrap();
        assert_eq!(implicit_hydrogens(&molfile), vec![0; 5]);
        assert_eq!(add_hydrogens(&molfile).len(), 5);
    }

    #[test]
    fn test_charges_change_hydrogen_counts() {
        // Acetate: the charged oxygen takes no hydrogen
        let text = "\
acetate
  charged

  4  3  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    1.5200    0.0000    0.0000 C   0  0  0  0  0  0  0  0  0  0  0  0
    2.1500    1.0800    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
    2.1500   -1.0800    0.0000 O   0  0  0  0  0  0  0  0  0  0  0  0
  1  2  1  0
  2  3  2  0
  2  4  1  0
M  CHG  1   4  -1
M  END
";
        let molfile = read_molfile(Cursor::new(text), "acetate").unwrap();
        assert_eq!(molfile.charges, vec![0, 0, 0, -1]);
        assert_eq!(implicit_hydrogens(&molfile), vec![3, 0, 0, 0]);

        // Ammonium through the atom-block charge column
        let text = "\
ammonium
  charged

  1  0  0  0  0  0  0  0  0  0999 V2000
    0.0000    0.0000    0.0000 N   0  3  0  0  0  0  0  0  0  0  0  0
M  END
";
        let molfile = read_molfile(Cursor::new(text), "ammonium").unwrap();
        assert_eq!(molfile.charges, vec![1]);
        let completed = add_hydrogens(&molfile);
        assert_eq!(completed.len(), 5);
        assert_eq!(hydrogens_of(&completed, 0).len(), 4);
    }

    #[test]
    fn test_aromatic_hydrogens_stay_in_plane() {
        let mut text = String::from("benzene\n  kekule\n\n  6  6  0  0  0  0  0  0  0  0999 V2000\n");
        for k in 0..6 {
            let angle = (k as f64 * 60.0).to_radians();
            text.push_str(&format!(
                "{:>10.4}{:>10.4}{:>10.4} C   0  0  0  0  0  0  0  0  0  0  0  0\n",
                1.39 * angle.cos(),
                1.39 * angle.sin(),
                0.0
            ));
        }
        for k in 0..6 {
            let order = if k % 2 == 0 { 2 } else { 1 };
            text.push_str(&format!("{:>3}{:>3}{:>3}  0\n", k + 1, (k + 1) % 6 + 1, order));
        }
        text.push_str("M  END\n");

        let molfile = read_molfile(Cursor::new(text), "benzene").unwrap();
        let completed = add_hydrogens(&molfile);
        assert_eq!(completed.len(), 12);
        for h in &completed.atoms[6..] {
            assert_approx_eq!(h.coordinates.z, 0.0, 1e-9);
            // Input coordinates carry four decimals
            assert_approx_eq!(h.coordinates.xy().norm(), 1.39 + 1.09, 1e-3);
        }
    }

    #[test]
    fn test_trigonal_directions_around_one_bond() {
        let bond = Vector3::new(1.0, 0.0, 0.0);
        let directions = hydrogen_directions(&[bond], Some(Vector3::y()), Geometry::Trigonal, 2);
        assert_eq!(directions.len(), 2);
        for d in &directions {
            assert_approx_eq!(d.dot(&bond), -0.5, 1e-9);
            assert_approx_eq!(d.z, 0.0, 1e-9);
        }
    }

    #[test]
    fn test_read_ligand_completes_molfiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pose.sdf");
        std::fs::write(&path, HEAVY_ETHANOL).unwrap();
        assert_eq!(read_ligand(&path).unwrap().len(), 9);
    }
}
