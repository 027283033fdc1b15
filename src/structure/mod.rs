//! Structure representation: an ordered collection of atoms grouped into residues

use crate::atom::{Atom, ResidueId};
use std::collections::HashMap;

/// A group of atoms sharing one residue identity
#[derive(Debug, Clone)]
pub struct Residue {
    /// Residue identity
    pub id: ResidueId,

    /// Indices into the owning structure's atom list, in file order
    pub atom_indices: Vec<usize>,
}

/// Represents a molecular structure (protein, ligand, or complex)
#[derive(Debug, Clone, Default)]
pub struct Structure {
    /// Name of the structure
    pub name: String,

    /// List of atoms in file order
    pub atoms: Vec<Atom>,
}

impl Structure {
    /// Create a new empty structure
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            atoms: Vec::new(),
        }
    }

    /// Add an atom to the structure
    pub fn add_atom(&mut self, atom: Atom) -> usize {
        let idx = self.atoms.len();
        self.atoms.push(atom);
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Group atoms into residues, ordered by first appearance
    pub fn residues(&self) -> Vec<Residue> {
        let mut residues: Vec<Residue> = Vec::new();
        let mut index: HashMap<ResidueId, usize> = HashMap::new();

        for (atom_idx, atom) in self.atoms.iter().enumerate() {
            let id = atom.residue_id();
            match index.get(&id) {
                Some(&slot) => residues[slot].atom_indices.push(atom_idx),
                None => {
                    index.insert(id.clone(), residues.len());
                    residues.push(Residue {
                        id,
                        atom_indices: vec![atom_idx],
                    });
                }
            }
        }

        residues
    }

    /// Chain identifiers in order of first appearance
    pub fn chain_ids(&self) -> Vec<char> {
        let mut chains = Vec::new();
        for atom in &self.atoms {
            if !chains.contains(&atom.chain_id) {
                chains.push(atom.chain_id);
            }
        }
        chains
    }

    /// Build a new structure containing only atoms whose residue passes `keep`
    ///
    /// Atom order and source serials are preserved.
    pub fn select_residues<F>(&self, name: &str, keep: F) -> Structure
    where
        F: Fn(&ResidueId) -> bool,
    {
        let atoms = self
            .atoms
            .iter()
            .filter(|atom| keep(&atom.residue_id()))
            .cloned()
            .collect();

        Structure {
            name: name.to_string(),
            atoms,
        }
    }
}
