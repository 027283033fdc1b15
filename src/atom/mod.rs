//! Atom representation and related functionality

use nalgebra::Vector3;
use std::fmt;

/// Residue labels treated as solvent or free ions.
///
/// Atoms carrying one of these labels belong to neither the protein nor the
/// ligand side of a partition. Comparison is case-insensitive.
pub const SOLVENT_LABELS: [&str; 9] = ["HOH", "WAT", "NA", "CL", "ZN", "K", "MG", "CA", "SOL"];

/// Check whether a residue label names water or a common ion
pub fn is_solvent_label(label: &str) -> bool {
    let label = label.trim();
    SOLVENT_LABELS
        .iter()
        .any(|solvent| solvent.eq_ignore_ascii_case(label))
}

/// Kind of coordinate record an atom was read from or is written as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Standard polymer atom (`ATOM`)
    Atom,
    /// Hetero atom (`HETATM`): ligands, ions, water
    Hetero,
}

impl RecordKind {
    /// Record name as it appears in columns 1-6 of a PDB file
    pub fn as_pdb_str(&self) -> &'static str {
        match self {
            RecordKind::Atom => "ATOM",
            RecordKind::Hetero => "HETATM",
        }
    }
}

/// Identity of the residue an atom belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResidueId {
    /// Chain identifier
    pub chain_id: char,

    /// Residue sequence number
    pub seq: i32,

    /// Insertion code (blank when absent)
    pub insertion_code: char,

    /// Residue name (e.g. "ALA", "HOH", "UNL")
    pub name: String,
}

impl fmt::Display for ResidueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.chain_id, self.name, self.seq)?;
        if self.insertion_code != ' ' {
            write!(f, "{}", self.insertion_code)?;
        }
        Ok(())
    }
}

/// Represents an atom in 3D space
#[derive(Debug, Clone)]
pub struct Atom {
    /// Record kind (ATOM or HETATM)
    pub record: RecordKind,

    /// Atom serial number as found in the source file (1-indexed)
    pub serial: u32,

    /// Atom name from PDB format (e.g., "CA", "N", "O")
    pub name: String,

    /// Residue name this atom belongs to
    pub residue_name: String,

    /// Chain identifier
    pub chain_id: char,

    /// Residue number this atom belongs to
    pub residue_num: i32,

    /// Insertion code
    pub insertion_code: char,

    /// 3D coordinates (in Angstroms)
    pub coordinates: Vector3<f64>,

    /// Occupancy
    pub occupancy: f64,

    /// Temperature factor
    pub b_factor: f64,

    /// Element symbol (may be empty if the source did not carry one)
    pub element: String,
}

impl Atom {
    /// Create a new atom with default occupancy and temperature factor
    pub fn new(
        record: RecordKind,
        serial: u32,
        name: String,
        residue_name: String,
        chain_id: char,
        residue_num: i32,
        coordinates: Vector3<f64>,
        element: String,
    ) -> Self {
        Self {
            record,
            serial,
            name,
            residue_name,
            chain_id,
            residue_num,
            insertion_code: ' ',
            coordinates,
            occupancy: 1.0,
            b_factor: 0.0,
            element,
        }
    }

    /// Calculate distance to another atom
    pub fn distance(&self, other: &Atom) -> f64 {
        (self.coordinates - other.coordinates).norm()
    }

    /// Identity of the residue this atom belongs to
    pub fn residue_id(&self) -> ResidueId {
        ResidueId {
            chain_id: self.chain_id,
            seq: self.residue_num,
            insertion_code: self.insertion_code,
            name: self.residue_name.clone(),
        }
    }

    /// Check if this atom is a hydrogen (or deuterium)
    ///
    /// Falls back to the atom name when no element symbol is present, the way
    /// PDB files without columns 77-78 are usually interpreted.
    pub fn is_hydrogen(&self) -> bool {
        let element = self.element.trim();
        if element.is_empty() {
            return self.name.trim_start().starts_with('H');
        }
        element.eq_ignore_ascii_case("H") || element.eq_ignore_ascii_case("D")
    }

    /// Check if this atom belongs to water or a free ion
    pub fn is_solvent(&self) -> bool {
        is_solvent_label(&self.residue_name)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} {} ({}, {}, {})",
            self.residue_id(),
            self.serial,
            self.name,
            self.coordinates.x,
            self.coordinates.y,
            self.coordinates.z
        )
    }
}

/// Guess an element symbol from a PDB atom name
///
/// Used when an input lacks the element columns. Digits and trailing
/// characters are stripped; two-letter symbols are only recognised for the
/// halogens and ions commonly found in protein-ligand complexes.
pub fn guess_element(atom_name: &str) -> String {
    let letters: String = atom_name
        .trim()
        .chars()
        .skip_while(|c| c.is_ascii_digit())
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let upper = letters.to_ascii_uppercase();
    for two in ["CL", "BR", "ZN", "MG", "NA", "FE"] {
        if upper.starts_with(two) && upper.len() == 2 {
            return format!("{}{}", &letters[..1].to_ascii_uppercase(), &letters[1..2].to_ascii_lowercase());
        }
    }
    upper.chars().next().map(|c| c.to_string()).unwrap_or_default()
}
