//! Positional event records.
//!
//! An event arrives as an ordered sequence of typed cells. Fields are
//! identified by their position, so every access is bounds checked and
//! type checked.

use std::fmt;

/// One typed cell of an event record.
#[derive(Clone, PartialEq, Eq)]
pub enum Cell {
    /// Signed integer.
    Integer(i64),
    /// Raw bytes.
    OctetString(Vec<u8>),
    /// Dotted object identifier.
    ObjectId(String),
    /// No value.
    Null,
}

impl Cell {
    /// Cell from a UTF-8 string.
    pub fn text(s: impl AsRef<str>) -> Self {
        Self::OctetString(s.as_ref().as_bytes().to_vec())
    }

    /// Cell from an optional string, `Null` when absent.
    pub fn text_or_null(s: Option<&str>) -> Self {
        s.map_or(Self::Null, Self::text)
    }

    /// Type tag used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::OctetString(_) => "octet string",
            Self::ObjectId(_) => "object id",
            Self::Null => "null",
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Integer(_) => 4,
            Self::OctetString(b) => b.len(),
            Self::ObjectId(s) => s.len(),
            Self::Null => 0,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "Integer({v})"),
            Self::OctetString(b) => match std::str::from_utf8(b) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "OctetString({s:?})"),
                _ => write!(f, "OctetString({b:02x?})"),
            },
            Self::ObjectId(s) => write!(f, "ObjectId({s})"),
            Self::Null => f.write_str("Null"),
        }
    }
}

/// Why a positional access failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// The record ends before the position.
    Missing {
        /// Requested position.
        index: usize,
        /// Number of cells in the record.
        len: usize,
    },
    /// The cell at the position has another type.
    WrongType {
        /// Requested position.
        index: usize,
        /// Expected type tag.
        expected: &'static str,
        /// Actual type tag.
        found: &'static str,
    },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { index, len } => {
                write!(f, "no field {index} in record of {len} cells")
            }
            Self::WrongType {
                index,
                expected,
                found,
            } => write!(f, "field {index} is {found}, expected {expected}"),
        }
    }
}

/// An ordered event record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    cells: Vec<Cell>,
}

impl Record {
    /// Record from an ordered list of cells.
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the record has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Every cell in order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Append a cell.
    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    /// Cell at `index`.
    pub fn get(&self, index: usize) -> Result<&Cell, FieldError> {
        self.cells.get(index).ok_or(FieldError::Missing {
            index,
            len: self.cells.len(),
        })
    }

    /// Integer at `index`.
    pub fn integer(&self, index: usize) -> Result<i64, FieldError> {
        match self.get(index)? {
            Cell::Integer(v) => Ok(*v),
            other => Err(wrong_type(index, "integer", other)),
        }
    }

    /// Octet string at `index`.
    pub fn octets(&self, index: usize) -> Result<&[u8], FieldError> {
        match self.get(index)? {
            Cell::OctetString(b) => Ok(b),
            other => Err(wrong_type(index, "octet string", other)),
        }
    }

    /// Octet string at `index`, decoded lossily as text.
    pub fn text(&self, index: usize) -> Result<String, FieldError> {
        self.octets(index)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Object identifier at `index`.
    pub fn object_id(&self, index: usize) -> Result<&str, FieldError> {
        match self.get(index)? {
            Cell::ObjectId(s) => Ok(s),
            other => Err(wrong_type(index, "object id", other)),
        }
    }
}

impl From<Vec<Cell>> for Record {
    fn from(cells: Vec<Cell>) -> Self {
        Self::new(cells)
    }
}

fn wrong_type(index: usize, expected: &'static str, found: &Cell) -> FieldError {
    FieldError::WrongType {
        index,
        expected,
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new(vec![
            Cell::ObjectId("1.3.6.1".to_owned()),
            Cell::Integer(7),
            Cell::text("LPAR1"),
            Cell::Null,
        ])
    }

    #[test]
    fn typed_access_by_position() {
        let r = sample();
        assert_eq!(r.object_id(0).expect("oid"), "1.3.6.1");
        assert_eq!(r.integer(1).expect("int"), 7);
        assert_eq!(r.text(2).expect("text"), "LPAR1");
        assert!(r.get(3).expect("null").is_empty());
    }

    #[test]
    fn out_of_range_is_missing() {
        let err = sample().integer(9).expect_err("expected error");
        assert_eq!(err, FieldError::Missing { index: 9, len: 4 });
        assert_eq!(err.to_string(), "no field 9 in record of 4 cells");
    }

    #[test]
    fn type_mismatch_is_reported() {
        let err = sample().integer(2).expect_err("expected error");
        assert_eq!(
            err,
            FieldError::WrongType {
                index: 2,
                expected: "integer",
                found: "octet string"
            }
        );
    }

    #[test]
    fn debug_shows_printable_octets_as_text() {
        assert_eq!(format!("{:?}", Cell::text("abc")), "OctetString(\"abc\")");
        assert_eq!(
            format!("{:?}", Cell::OctetString(vec![0, 1])),
            "OctetString([00, 01])"
        );
    }
}
