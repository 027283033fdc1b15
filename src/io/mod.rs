//! Input/output functionality for structure files (PDB and SDF/MOL)

use nalgebra::Vector3;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::atom::{guess_element, Atom, RecordKind};
use crate::structure::Structure;

/// Errors that can occur during file I/O operations
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Atom {atom}: {message} does not fit the PDB columns")]
    ColumnOverflow { atom: usize, message: String },
}

/// Largest serial the five-column PDB serial field can hold
pub const MAX_PDB_SERIAL: usize = 99_999;

fn stem_of(path: &Path) -> &str {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
}

/// Read a structure, choosing the parser from the file extension
///
/// `.pdb`/`.ent` are read as PDB, `.sdf`/`.mol` as a V2000 molfile.
pub fn read_structure<P: AsRef<Path>>(path: P) -> Result<Structure, IoError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdb" | "ent" => parse_pdb(path),
        "sdf" | "mol" => parse_sdf(path),
        other => Err(IoError::UnsupportedFormat(format!(
            "'{}' ({})",
            path.display(),
            if other.is_empty() { "no extension" } else { other }
        ))),
    }
}

/// Parse a PDB file into a Structure
pub fn parse_pdb<P: AsRef<Path>>(path: P) -> Result<Structure, IoError> {
    let file = File::open(path.as_ref())?;
    read_pdb(BufReader::new(file), stem_of(path.as_ref()))
}

/// Parse PDB records from any buffered reader
///
/// Only the first model of a multi-model file is read.
pub fn read_pdb<R: BufRead>(reader: R, name: &str) -> Result<Structure, IoError> {
    let mut structure = Structure::new(name);
    let mut line_number = 0;

    for line in reader.lines() {
        let line = line?;
        line_number += 1;

        if line.starts_with("ATOM") || line.starts_with("HETATM") {
            let atom = parse_pdb_atom(&line, line_number)?;
            structure.add_atom(atom);
        } else if line.starts_with("ENDMDL") {
            break;
        }
    }

    Ok(structure)
}

fn parse_pdb_atom(line: &str, line_number: usize) -> Result<Atom, IoError> {
    if !line.is_ascii() {
        return Err(IoError::Parse {
            line: line_number,
            message: "non-ASCII characters in coordinate record".to_string(),
        });
    }
    if line.len() < 54 {
        return Err(IoError::Parse {
            line: line_number,
            message: format!("Line too short for atom record: {}", line),
        });
    }
    let padded = format!("{line:<80}");

    let record = if padded.starts_with("HETATM") {
        RecordKind::Hetero
    } else {
        RecordKind::Atom
    };

    let serial = padded[6..11]
        .trim()
        .parse::<u32>()
        .map_err(|_| IoError::Parse {
            line: line_number,
            message: format!("Invalid atom serial number: {}", &padded[6..11]),
        })?;

    let name = padded[12..16].trim().to_string();
    let residue_name = padded[17..20].trim().to_string();
    let chain_id = padded[21..22].chars().next().unwrap_or(' ');

    let residue_num = padded[22..26]
        .trim()
        .parse::<i32>()
        .map_err(|_| IoError::Parse {
            line: line_number,
            message: format!("Invalid residue number: {}", &padded[22..26]),
        })?;
    let insertion_code = padded[26..27].chars().next().unwrap_or(' ');

    let coordinate = |range: std::ops::Range<usize>, axis: &str| {
        padded[range.clone()]
            .trim()
            .parse::<f64>()
            .map_err(|_| IoError::Parse {
                line: line_number,
                message: format!("Invalid {} coordinate: {}", axis, &padded[range]),
            })
    };
    let x = coordinate(30..38, "x")?;
    let y = coordinate(38..46, "y")?;
    let z = coordinate(46..54, "z")?;

    let occupancy = padded[54..60].trim().parse::<f64>().unwrap_or(1.0);
    let b_factor = padded[60..66].trim().parse::<f64>().unwrap_or(0.0);

    let element = match padded[76..78].trim() {
        "" => guess_element(&name),
        symbol => symbol.to_string(),
    };

    let mut atom = Atom::new(
        record,
        serial,
        name,
        residue_name,
        chain_id,
        residue_num,
        Vector3::new(x, y, z),
        element,
    );
    atom.insertion_code = insertion_code;
    atom.occupancy = occupancy;
    atom.b_factor = b_factor;

    Ok(atom)
}

/// Bond order codes of a V2000 bond block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl BondOrder {
    fn from_code(code: usize) -> Option<Self> {
        match code {
            1 => Some(BondOrder::Single),
            2 => Some(BondOrder::Double),
            3 => Some(BondOrder::Triple),
            4 => Some(BondOrder::Aromatic),
            _ => None,
        }
    }

    /// Contribution of the bond to an atom's valence
    pub fn valence(&self) -> f64 {
        match self {
            BondOrder::Single => 1.0,
            BondOrder::Double => 2.0,
            BondOrder::Triple => 3.0,
            BondOrder::Aromatic => 1.5,
        }
    }
}

/// A bond between two atoms, given as zero-based positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bond {
    pub first: usize,
    pub second: usize,
    pub order: BondOrder,
}

/// One molfile record: atoms plus the bond table and formal charges
#[derive(Debug, Clone)]
pub struct Molfile {
    pub structure: Structure,
    pub bonds: Vec<Bond>,

    /// Formal charge of every atom, in atom order
    pub charges: Vec<i32>,
}

/// Parse the first record of an SDF (or a MOL file) into a Structure
pub fn parse_sdf<P: AsRef<Path>>(path: P) -> Result<Structure, IoError> {
    Ok(parse_molfile(path)?.structure)
}

/// Parse the first record of an SDF (or a MOL file), keeping bonds and charges
pub fn parse_molfile<P: AsRef<Path>>(path: P) -> Result<Molfile, IoError> {
    let file = File::open(path.as_ref())?;
    read_molfile(BufReader::new(file), stem_of(path.as_ref()))
}

/// Parse a V2000 molfile block from any buffered reader
///
/// Atoms become HETATM records of a single residue named `UNL`, numbered from 1
/// and named after their element with a per-element counter (C1, C2, N1, ...).
pub fn read_sdf<R: BufRead>(reader: R, name: &str) -> Result<Structure, IoError> {
    Ok(read_molfile(reader, name)?.structure)
}

/// Charge column codes of the V2000 atom block
fn charge_from_code(code: i32) -> i32 {
    match code {
        1..=3 | 5..=7 => 4 - code,
        _ => 0,
    }
}

/// Parse a V2000 molfile block with its bond table and formal charges
pub fn read_molfile<R: BufRead>(reader: R, name: &str) -> Result<Molfile, IoError> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim() == "$$$$" {
            break;
        }
        lines.push((i + 1, line));
    }

    if lines.len() < 4 {
        return Err(IoError::InvalidFormat(
            "SDF block must contain a header and a counts line".to_string(),
        ));
    }

    let (counts_line_no, counts_line) = &lines[3];
    if counts_line.contains("V3000") {
        return Err(IoError::UnsupportedFormat("V3000 molfile".to_string()));
    }

    let invalid_counts = || IoError::Parse {
        line: *counts_line_no,
        message: format!("Invalid counts line: {}", counts_line),
    };
    let atom_count = counts_field(counts_line, 0..3, 0).ok_or_else(invalid_counts)?;
    let bond_count = counts_field(counts_line, 3..6, 1).ok_or_else(invalid_counts)?;

    if atom_count == 0 {
        return Err(IoError::InvalidFormat("molecule contains no atoms".to_string()));
    }
    if lines.len() < 4 + atom_count + bond_count {
        return Err(IoError::InvalidFormat(format!(
            "SDF block declares {} atoms and {} bonds but ends early",
            atom_count, bond_count
        )));
    }

    let mut structure = Structure::new(name);
    let mut charges = Vec::with_capacity(atom_count);
    let mut element_counts: Vec<(String, usize)> = Vec::new();

    for (line_number, raw) in &lines[4..4 + atom_count] {
        if !raw.is_ascii() {
            return Err(IoError::Parse {
                line: *line_number,
                message: "non-ASCII characters in atom block".to_string(),
            });
        }
        let padded = format!("{raw:<40}");
        let coordinate = |range: std::ops::Range<usize>, axis: &str| {
            padded[range.clone()]
                .trim()
                .parse::<f64>()
                .map_err(|_| IoError::Parse {
                    line: *line_number,
                    message: format!("Invalid {} coordinate: {}", axis, &padded[range]),
                })
        };
        let x = coordinate(0..10, "x")?;
        let y = coordinate(10..20, "y")?;
        let z = coordinate(20..30, "z")?;

        let element = padded[31..34].trim().to_string();
        if element.is_empty() {
            return Err(IoError::Parse {
                line: *line_number,
                message: "missing element symbol".to_string(),
            });
        }
        let charge_code = padded[36..39].trim().parse::<i32>().unwrap_or(0);
        charges.push(charge_from_code(charge_code));

        let count = match element_counts.iter_mut().find(|(e, _)| *e == element) {
            Some((_, n)) => {
                *n += 1;
                *n
            }
            None => {
                element_counts.push((element.clone(), 1));
                1
            }
        };

        let serial = structure.len() as u32 + 1;
        structure.add_atom(Atom::new(
            RecordKind::Hetero,
            serial,
            format!("{}{}", element.to_ascii_uppercase(), count),
            "UNL".to_string(),
            ' ',
            1,
            Vector3::new(x, y, z),
            element,
        ));
    }

    let bond_start = 4 + atom_count;
    let mut bonds = Vec::with_capacity(bond_count);
    for (line_number, raw) in &lines[bond_start..bond_start + bond_count] {
        let invalid = |message: String| IoError::Parse {
            line: *line_number,
            message,
        };
        let fields: Vec<usize> = [0..3, 3..6, 6..9]
            .into_iter()
            .enumerate()
            .map(|(i, range)| counts_field(raw, range, i))
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| invalid(format!("Invalid bond line: {}", raw)))?;

        let (first, second) = (fields[0], fields[1]);
        if first == 0 || second == 0 || first > atom_count || second > atom_count || first == second {
            return Err(invalid(format!("Bond {}-{} references no valid atom pair", first, second)));
        }
        let order = BondOrder::from_code(fields[2])
            .ok_or_else(|| invalid(format!("Unsupported bond order {}", fields[2])))?;
        bonds.push(Bond {
            first: first - 1,
            second: second - 1,
            order,
        });
    }

    // M  CHG entries replace every charge given in the atom block
    let mut charge_block: Option<Vec<(usize, i32)>> = None;
    for (line_number, raw) in &lines[bond_start + bond_count..] {
        if raw.starts_with("M  END") {
            break;
        }
        if !raw.starts_with("M  CHG") {
            continue;
        }
        let values: Vec<i64> = raw[6..]
            .split_whitespace()
            .map(|v| v.parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| IoError::Parse {
                line: *line_number,
                message: format!("Invalid charge line: {}", raw),
            })?;
        let entries = charge_block.get_or_insert_with(Vec::new);
        // The first value is the entry count
        for pair in values.get(1..).unwrap_or(&[]).chunks(2) {
            if let [atom, charge] = pair {
                let atom = *atom as usize;
                if atom == 0 || atom > atom_count {
                    return Err(IoError::Parse {
                        line: *line_number,
                        message: format!("Charge on missing atom {}", atom),
                    });
                }
                entries.push((atom - 1, *charge as i32));
            }
        }
    }
    if let Some(entries) = charge_block {
        charges.iter_mut().for_each(|c| *c = 0);
        for (atom, charge) in entries {
            charges[atom] = charge;
        }
    }

    Ok(Molfile {
        structure,
        bonds,
        charges,
    })
}

/// V2000 counts fields are fixed-width; fall back to whitespace splitting for
/// files written by tools that do not pad them.
fn counts_field(line: &str, range: std::ops::Range<usize>, token: usize) -> Option<usize> {
    if let Some(value) = line.get(range).and_then(|s| s.trim().parse::<usize>().ok()) {
        return Some(value);
    }
    line.split_whitespace().nth(token)?.parse::<usize>().ok()
}

/// Format an atom name for columns 13-16
///
/// Names shorter than four characters with a one-letter element start in
/// column 14, following the PDB convention.
fn format_atom_name(name: &str, element: &str) -> String {
    if name.len() >= 4 || element.trim().len() == 2 {
        format!("{:<4}", name)
    } else {
        format!(" {:<3}", name)
    }
}

/// Reject structures whose fields would spill out of the fixed PDB columns
fn check_pdb_columns(structure: &Structure) -> Result<(), IoError> {
    if structure.len() > MAX_PDB_SERIAL {
        return Err(IoError::ColumnOverflow {
            atom: MAX_PDB_SERIAL + 1,
            message: format!("serial of a {}-atom structure", structure.len()),
        });
    }

    for (i, atom) in structure.atoms.iter().enumerate() {
        let overflow = |message: String| IoError::ColumnOverflow { atom: i + 1, message };

        if atom.name.trim().len() > 4 {
            return Err(overflow(format!("atom name '{}'", atom.name)));
        }
        if atom.residue_name.trim().len() > 3 {
            return Err(overflow(format!("residue name '{}'", atom.residue_name)));
        }
        if !(-999..=9999).contains(&atom.residue_num) {
            return Err(overflow(format!("residue number {}", atom.residue_num)));
        }
        let c = &atom.coordinates;
        if [c.x, c.y, c.z].iter().any(|v| !(-999.999..=9999.999).contains(v)) {
            return Err(overflow(format!("coordinate ({:.3}, {:.3}, {:.3})", c.x, c.y, c.z)));
        }
    }
    Ok(())
}

/// Write a structure as PDB records to any writer
///
/// Atom serials are renumbered sequentially from 1 in output order and TER
/// records do not consume a serial, so the written serial of every atom is its
/// zero-based position plus one.
pub fn write_pdb_to<W: Write>(structure: &Structure, mut writer: W) -> Result<(), IoError> {
    check_pdb_columns(structure)?;
    writeln!(writer, "REMARK   1 GENERATED BY POSE-RANK")?;

    let mut previous: Option<&Atom> = None;
    for (i, atom) in structure.atoms.iter().enumerate() {
        if let Some(prev) = previous {
            if prev.chain_id != atom.chain_id {
                write_ter(&mut writer, i, prev)?;
            }
        }

        writeln!(
            writer,
            "{:<6}{:>5} {}{:1}{:>3} {:1}{:>4}{:1}   {:>8.3}{:>8.3}{:>8.3}{:>6.2}{:>6.2}          {:>2}",
            atom.record.as_pdb_str(),
            i + 1, // 1-based index
            format_atom_name(atom.name.trim(), &atom.element),
            ' ',
            atom.residue_name,
            atom.chain_id,
            atom.residue_num,
            atom.insertion_code,
            atom.coordinates.x,
            atom.coordinates.y,
            atom.coordinates.z,
            atom.occupancy,
            atom.b_factor,
            atom.element.to_ascii_uppercase(),
        )?;
        previous = Some(atom);
    }

    if let Some(last) = previous {
        write_ter(&mut writer, structure.len(), last)?;
    }
    writeln!(writer, "END")?;
    writer.flush()?;

    Ok(())
}

fn write_ter<W: Write>(writer: &mut W, serial: usize, atom: &Atom) -> Result<(), IoError> {
    writeln!(
        writer,
        "TER   {:>5}      {:>3} {:1}{:>4}{:1}",
        serial, atom.residue_name, atom.chain_id, atom.residue_num, atom.insertion_code
    )?;
    Ok(())
}

/// Write a structure to a PDB file
pub fn write_pdb<P: AsRef<Path>>(structure: &Structure, path: P) -> Result<(), IoError> {
    let file = File::create(path)?;
    write_pdb_to(structure, BufWriter::new(file))
}
