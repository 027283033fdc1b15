//! Partitioning of protein-ligand complexes by residue label
//!
//! A complex is formed by relabelling every ligand atom with a sentinel residue
//! name, which lets every later step tell ligand from protein purely by label.
//! Splitting is the inverse: ligand residues go one way, everything else that is
//! not water or a free ion goes the other.

use log::debug;
use thiserror::Error;

use crate::atom::{is_solvent_label, RecordKind};
use crate::structure::Structure;

/// Default sentinel residue label for ligand atoms
pub const LIGAND_LABEL: &str = "UNL";

/// Errors that can occur while partitioning structures
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Ligand structure contains no atoms")]
    EmptyLigand,

    #[error("Ligand spans {0} residues; expected a single molecule")]
    MultipleLigandResidues(usize),

    #[error("Protein structure contains no atoms")]
    EmptyProtein,

    #[error("Structure contains no residue labelled '{0}'")]
    LigandNotFound(String),
}

/// Protein-only and ligand-only halves of a complex
#[derive(Debug, Clone)]
pub struct Split {
    /// Protein atoms (solvent and ions excluded)
    pub protein: Structure,

    /// Ligand atoms
    pub ligand: Structure,

    /// 1-indexed source serials of the retained non-hydrogen protein atoms
    pub protein_serials: Vec<u32>,
}

/// Whether a residue name carries the ligand label, ignoring column padding
pub fn is_ligand_label(name: &str, ligand_label: &str) -> bool {
    name.trim() == ligand_label
}

/// Pick a chain identifier for the ligand that the protein does not already use
fn ligand_chain_id(protein: &Structure) -> char {
    let used = protein.chain_ids();
    std::iter::once('L')
        .chain('A'..='Z')
        .chain('a'..='z')
        .find(|c| !used.contains(c))
        .unwrap_or('L')
}

/// Merge a protein and a ligand into one complex
///
/// Every ligand atom is relabelled to `ligand_label` and moved into a single
/// residue on a chain the protein does not use. The ligand must be one molecule:
/// an empty ligand, or one whose atoms span several residues, is rejected.
pub fn form_complex(
    protein: &Structure,
    ligand: &Structure,
    ligand_label: &str,
) -> Result<Structure, PartitionError> {
    if ligand.is_empty() {
        return Err(PartitionError::EmptyLigand);
    }
    if protein.is_empty() {
        return Err(PartitionError::EmptyProtein);
    }
    let ligand_residues = ligand.residues().len();
    if ligand_residues > 1 {
        return Err(PartitionError::MultipleLigandResidues(ligand_residues));
    }

    let chain_id = ligand_chain_id(protein);
    let mut complex = Structure::new("complex");
    for atom in &protein.atoms {
        complex.add_atom(atom.clone());
    }
    for atom in &ligand.atoms {
        let mut atom = atom.clone();
        atom.record = RecordKind::Hetero;
        atom.residue_name = ligand_label.to_string();
        atom.chain_id = chain_id;
        atom.residue_num = 1;
        atom.insertion_code = ' ';
        complex.add_atom(atom);
    }

    debug!(
        "Formed complex: {} protein atoms + {} ligand atoms on chain {}",
        protein.len(),
        ligand.len(),
        chain_id
    );

    Ok(complex)
}

/// Serials of protein atoms: neither ligand nor solvent
///
/// Serials are the 1-indexed numbers found in the structure, which for a file
/// produced by [`crate::io::write_pdb`] equal position + 1.
pub fn protein_atom_serials(
    structure: &Structure,
    ligand_label: &str,
    include_hydrogens: bool,
) -> Vec<u32> {
    structure
        .atoms
        .iter()
        .filter(|atom| !is_ligand_label(&atom.residue_name, ligand_label) && !atom.is_solvent())
        .filter(|atom| include_hydrogens || !atom.is_hydrogen())
        .map(|atom| atom.serial)
        .collect()
}

/// Partition a complex into protein-only and ligand-only structures
pub fn split_structure(structure: &Structure, ligand_label: &str) -> Result<Split, PartitionError> {
    let ligand = structure.select_residues("ligand", |id| is_ligand_label(&id.name, ligand_label));
    if ligand.is_empty() {
        return Err(PartitionError::LigandNotFound(ligand_label.to_string()));
    }

    let protein = structure.select_residues("protein", |id| {
        !is_ligand_label(&id.name, ligand_label) && !is_solvent_label(&id.name)
    });
    let protein_serials = protein_atom_serials(structure, ligand_label, false);

    Ok(Split {
        protein,
        ligand,
        protein_serials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use nalgebra::Vector3;

    fn atom(serial: u32, name: &str, residue: &str, chain: char, seq: i32, element: &str) -> Atom {
        Atom::new(
            RecordKind::Atom,
            serial,
            name.to_string(),
            residue.to_string(),
            chain,
            seq,
            Vector3::new(serial as f64, 0.0, 0.0),
            element.to_string(),
        )
    }

    fn protein() -> Structure {
        let mut p = Structure::new("protein");
        p.add_atom(atom(1, "N", "ALA", 'A', 1, "N"));
        p.add_atom(atom(2, "CA", "ALA", 'A', 1, "C"));
        p.add_atom(atom(3, "HA", "ALA", 'A', 1, "H"));
        p.add_atom(atom(4, "O", "HOH", 'A', 201, "O"));
        p.add_atom(atom(5, "ZN", "ZN", 'A', 202, "Zn"));
        p
    }

    fn ligand() -> Structure {
        let mut l = Structure::new("ligand");
        l.add_atom(atom(1, "C1", "LIG", ' ', 1, "C"));
        l.add_atom(atom(2, "O1", "LIG", ' ', 1, "O"));
        l.add_atom(atom(3, "H1", "LIG", ' ', 1, "H"));
        l
    }

    #[test]
    fn test_form_complex_relabels_ligand() {
        let complex = form_complex(&protein(), &ligand(), LIGAND_LABEL).unwrap();
        assert_eq!(complex.len(), 8);

        let ligand_atoms: Vec<_> = complex.atoms.iter().filter(|a| a.residue_name == "UNL").collect();
        assert_eq!(ligand_atoms.len(), 3);
        assert!(ligand_atoms.iter().all(|a| a.chain_id == 'L'));
        assert!(ligand_atoms.iter().all(|a| a.record == RecordKind::Hetero));
    }

    #[test]
    fn test_form_complex_avoids_used_chain() {
        let mut p = protein();
        p.atoms[0].chain_id = 'L';
        let complex = form_complex(&p, &ligand(), LIGAND_LABEL).unwrap();
        let chain = complex.atoms.last().unwrap().chain_id;
        assert_ne!(chain, 'L');
        assert_ne!(chain, 'A');
    }

    #[test]
    fn test_form_complex_rejects_bad_ligand() {
        let empty = Structure::new("empty");
        assert!(matches!(
            form_complex(&protein(), &empty, LIGAND_LABEL),
            Err(PartitionError::EmptyLigand)
        ));

        let mut two = ligand();
        two.atoms[2].residue_num = 2;
        assert!(matches!(
            form_complex(&protein(), &two, LIGAND_LABEL),
            Err(PartitionError::MultipleLigandResidues(2))
        ));
    }

    #[test]
    fn test_split_recovers_disjoint_sets() {
        let complex = form_complex(&protein(), &ligand(), LIGAND_LABEL).unwrap();
        let split = split_structure(&complex, LIGAND_LABEL).unwrap();

        assert_eq!(split.protein.len(), 3);
        assert_eq!(split.ligand.len(), 3);

        let non_solvent = complex.atoms.iter().filter(|a| !a.is_solvent()).count();
        assert_eq!(split.protein.len() + split.ligand.len(), non_solvent);

        assert!(split.protein.atoms.iter().all(|a| a.residue_name != "UNL"));
        assert!(split.ligand.atoms.iter().all(|a| a.residue_name == "UNL"));
    }

    #[test]
    fn test_split_protein_serials_skip_hydrogens_and_solvent() {
        let complex = form_complex(&protein(), &ligand(), LIGAND_LABEL).unwrap();
        let split = split_structure(&complex, LIGAND_LABEL).unwrap();
        assert_eq!(split.protein_serials, vec![1, 2]);

        let with_h = protein_atom_serials(&complex, LIGAND_LABEL, true);
        assert_eq!(with_h, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_without_ligand_fails() {
        assert!(matches!(
            split_structure(&protein(), LIGAND_LABEL),
            Err(PartitionError::LigandNotFound(_))
        ));
    }
}
