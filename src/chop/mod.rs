//! Spatial chopping: reduce a complex to the residues around its ligand
//!
//! A protein residue is a contact residue when any of its atoms lies strictly
//! closer than the cutoff to any ligand atom. The chopped structure keeps every
//! ligand residue plus the contact residues, in source order.

use log::debug;
use std::collections::HashSet;

use crate::atom::{is_solvent_label, ResidueId};
use crate::partition::is_ligand_label;
use crate::structure::{Residue, Structure};

/// Default chopping distance in Angstroms
pub const DEFAULT_DISTANCE_CUTOFF: f64 = 5.0;

/// Find the protein residues with at least one atom strictly within `distance_cutoff`
/// of a ligand atom
pub fn contact_residues(
    structure: &Structure,
    ligand_label: &str,
    distance_cutoff: f64,
) -> HashSet<ResidueId> {
    let residues = structure.residues();
    let (ligand, protein): (Vec<&Residue>, Vec<&Residue>) = residues
        .iter()
        .filter(|r| is_ligand_label(&r.id.name, ligand_label) || !is_solvent_label(&r.id.name))
        .partition(|r| is_ligand_label(&r.id.name, ligand_label));

    let ligand_atoms: Vec<usize> = ligand
        .iter()
        .flat_map(|r| r.atom_indices.iter().copied())
        .collect();

    let mut contacts = HashSet::new();
    for residue in protein {
        let touches = residue.atom_indices.iter().any(|&p| {
            ligand_atoms
                .iter()
                .any(|&l| structure.atoms[l].distance(&structure.atoms[p]) < distance_cutoff)
        });
        if touches {
            contacts.insert(residue.id.clone());
        }
    }

    contacts
}

/// Pull residues that continue a retained run into the retained set
///
/// Each chain holding at least one contact residue is walked in order. A residue
/// is retained if it is already a contact, or if its sequence number is exactly
/// one greater than the previously retained residue's in that chain.
fn expand_chain_breaks(
    protein_residues: &[&Residue],
    contacts: &HashSet<ResidueId>,
) -> HashSet<ResidueId> {
    let mut retained = contacts.clone();

    let mut chains: Vec<char> = Vec::new();
    for residue in protein_residues {
        if contacts.contains(&residue.id) && !chains.contains(&residue.id.chain_id) {
            chains.push(residue.id.chain_id);
        }
    }

    for chain in chains {
        let mut previous_seq: Option<i32> = None;
        for residue in protein_residues.iter().filter(|r| r.id.chain_id == chain) {
            let seq = residue.id.seq;
            if retained.contains(&residue.id) {
                previous_seq = Some(seq);
            } else if previous_seq.map_or(false, |prev| seq == prev + 1) {
                retained.insert(residue.id.clone());
                previous_seq = Some(seq);
            }
        }
    }

    retained
}

/// Reduce a complex to the ligand and the protein residues around it
pub fn chop(
    structure: &Structure,
    ligand_label: &str,
    distance_cutoff: f64,
    expand: bool,
) -> Structure {
    let contacts = contact_residues(structure, ligand_label, distance_cutoff);

    let retained = if expand {
        let residues = structure.residues();
        let protein: Vec<&Residue> = residues
            .iter()
            .filter(|r| !is_ligand_label(&r.id.name, ligand_label) && !is_solvent_label(&r.id.name))
            .collect();
        expand_chain_breaks(&protein, &contacts)
    } else {
        contacts
    };

    let chopped = structure.select_residues("complex_chopped", |id| {
        is_ligand_label(&id.name, ligand_label) || retained.contains(id)
    });

    debug!(
        "Chopped {} atoms to {} atoms ({} protein residues within {:.2} A)",
        structure.len(),
        chopped.len(),
        retained.len(),
        distance_cutoff
    );

    chopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, RecordKind};
    use crate::partition::LIGAND_LABEL;
    use nalgebra::Vector3;

    fn push(s: &mut Structure, residue: &str, chain: char, seq: i32, pos: [f64; 3]) {
        let serial = s.len() as u32 + 1;
        s.add_atom(Atom::new(
            RecordKind::Atom,
            serial,
            "CA".to_string(),
            residue.to_string(),
            chain,
            seq,
            Vector3::new(pos[0], pos[1], pos[2]),
            "C".to_string(),
        ));
    }

    fn residue_seqs(s: &Structure) -> Vec<i32> {
        s.residues()
            .iter()
            .filter(|r| r.id.name != LIGAND_LABEL)
            .map(|r| r.id.seq)
            .collect()
    }

    #[test]
    fn test_cutoff_example() {
        let mut s = Structure::new("complex");
        push(&mut s, "ALA", 'A', 1, [10.0, 10.0, 10.0]);
        push(&mut s, LIGAND_LABEL, 'L', 1, [12.0, 12.0, 12.0]);

        let wide = chop(&s, LIGAND_LABEL, 5.0, false);
        assert_eq!(residue_seqs(&wide), vec![1]);

        let narrow = chop(&s, LIGAND_LABEL, 3.0, false);
        assert!(residue_seqs(&narrow).is_empty());
        // Ligand is always kept
        assert_eq!(narrow.len(), 1);
        assert_eq!(narrow.atoms[0].residue_name, LIGAND_LABEL);
    }

    #[test]
    fn test_padded_ligand_name_matches_label() {
        let mut s = Structure::new("complex");
        push(&mut s, "ALA", 'A', 1, [2.0, 0.0, 0.0]);
        push(&mut s, "ALA", 'A', 2, [30.0, 0.0, 0.0]);
        push(&mut s, " UNL ", 'L', 1, [0.0, 0.0, 0.0]);

        let chopped = chop(&s, LIGAND_LABEL, 5.0, false);
        assert_eq!(chopped.len(), 2);
        assert_eq!(chopped.atoms[1].residue_name, " UNL ");
        assert_eq!(contact_residues(&s, LIGAND_LABEL, 5.0).len(), 1);

        let split = crate::partition::split_structure(&chopped, LIGAND_LABEL).unwrap();
        assert_eq!(split.ligand.len(), 1);
        assert_eq!(split.protein.len(), 1);
    }

    #[test]
    fn test_exact_cutoff_is_excluded() {
        let mut s = Structure::new("complex");
        push(&mut s, "GLY", 'A', 1, [3.0, 0.0, 0.0]);
        push(&mut s, LIGAND_LABEL, 'L', 1, [0.0, 0.0, 0.0]);

        assert!(residue_seqs(&chop(&s, LIGAND_LABEL, 3.0, false)).is_empty());
        assert_eq!(residue_seqs(&chop(&s, LIGAND_LABEL, 3.0001, false)), vec![1]);
    }

    #[test]
    fn test_solvent_is_never_a_contact() {
        let mut s = Structure::new("complex");
        push(&mut s, "HOH", 'A', 100, [1.0, 0.0, 0.0]);
        push(&mut s, LIGAND_LABEL, 'L', 1, [0.0, 0.0, 0.0]);

        let chopped = chop(&s, LIGAND_LABEL, 5.0, false);
        assert_eq!(chopped.len(), 1);
    }

    #[test]
    fn test_residue_kept_when_any_atom_is_close() {
        let mut s = Structure::new("complex");
        push(&mut s, "LYS", 'A', 7, [50.0, 0.0, 0.0]);
        push(&mut s, "LYS", 'A', 7, [4.0, 0.0, 0.0]);
        push(&mut s, LIGAND_LABEL, 'L', 1, [0.0, 0.0, 0.0]);

        let chopped = chop(&s, LIGAND_LABEL, 5.0, false);
        // Whole residue retained, including the distant atom
        assert_eq!(chopped.len(), 3);
    }

    fn gapped_chain() -> Structure {
        let mut s = Structure::new("complex");
        push(&mut s, "ALA", 'A', 1, [40.0, 0.0, 0.0]);
        push(&mut s, "ALA", 'A', 2, [2.0, 0.0, 0.0]);
        push(&mut s, "ALA", 'A', 3, [40.0, 5.0, 0.0]);
        push(&mut s, "ALA", 'A', 4, [0.0, 2.0, 0.0]);
        push(&mut s, "ALA", 'A', 6, [40.0, 9.0, 0.0]);
        push(&mut s, "ALA", 'B', 1, [60.0, 0.0, 0.0]);
        push(&mut s, LIGAND_LABEL, 'L', 1, [0.0, 0.0, 0.0]);
        s
    }

    #[test]
    fn test_without_expansion_gap_remains() {
        let chopped = chop(&gapped_chain(), LIGAND_LABEL, 3.0, false);
        assert_eq!(residue_seqs(&chopped), vec![2, 4]);
    }

    #[test]
    fn test_chain_break_expansion() {
        let chopped = chop(&gapped_chain(), LIGAND_LABEL, 3.0, true);
        // 3 follows retained 2; 4 is a contact; 6 does not follow 4; residue 1
        // precedes the first retained residue; chain B has no contacts.
        assert_eq!(residue_seqs(&chopped), vec![2, 3, 4]);
    }
}
