//! Decode engine
//!
//! Turns a block of raw register words into named measurements using the
//! register catalog. Failures are isolated per field: a field that cannot be
//! decoded is logged and left out, the rest of the snapshot still goes out.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{
    Decoder, RegisterCatalog, RegisterSpec, WordOrder, FAULT_TABLE, GRID_CONNECTION_TABLE,
    INVERTER_STATE_TABLE,
};
use crate::error::{InvSrvError, Result};
use crate::snapshot::{MetricValue, Value};

/// Text produced by the fault decoder when no bit is set
pub const NO_ERRORS: &str = "No Errors Detected";

/// Raw register words indexed by absolute address, starting at 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRegisterBlock {
    words: Vec<u16>,
}

impl RawRegisterBlock {
    pub fn new(words: Vec<u16>) -> Self {
        Self { words }
    }

    pub fn extend_from_slice(&mut self, words: &[u16]) {
        self.words.extend_from_slice(words);
    }

    /// Words `[start, start + count)`, or `None` when the block is too short
    pub fn slice(&self, start: u16, count: u16) -> Option<&[u16]> {
        let start = usize::from(start);
        self.words.get(start..start + usize::from(count))
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Per-field decode failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("registers {start}..={end} not in block of {available} words")]
    OutOfRange {
        start: u32,
        end: u32,
        available: usize,
    },

    #[error("expected {expected} words, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("code {code} not in table {table}")]
    UnknownCode { table: String, code: u16 },

    #[error("numeric measurement decoded to text: {0}")]
    NotNumeric(String),
}

/// Code → description table
pub type CodeTable = BTreeMap<u32, String>;

/// Named tables used by lookup and bitmask decoders
#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    tables: HashMap<String, CodeTable>,
}

impl LookupTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<I, S>(mut self, name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        self.tables.insert(
            name.into(),
            entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&CodeTable> {
        self.tables.get(name)
    }

    /// Tables referenced by the Deye catalog
    pub fn deye() -> Self {
        Self::new()
            .with_table(
                INVERTER_STATE_TABLE,
                [
                    (0, "standby"),
                    (1, "selfcheck"),
                    (2, "ok"),
                    (3, "alarm"),
                    (4, "fault"),
                    (5, "activating"),
                ],
            )
            .with_table(GRID_CONNECTION_TABLE, [(0, "OFF"), (1, "ON")])
            .with_table(
                FAULT_TABLE,
                [
                    (13, "Working mode change"),
                    (18, "AC over current"),
                    (20, "DC over current"),
                    (23, "AC leak current or transient over current"),
                    (24, "DC insulation impedance"),
                    (26, "DC busbar imbalanced"),
                    (29, "Parallel comms cable"),
                    (35, "No AC grid"),
                    (42, "AC line low voltage"),
                    (47, "AC freq high/low"),
                    (56, "DC busbar voltage low"),
                    (63, "ARC fault"),
                    (64, "Heat sink tempfailure"),
                ],
            )
    }
}

/// Describe the set bits of consecutive fault registers
///
/// Bit `b` of word `w` is reported as `F{w*16 + b + 1:02}`. Its description
/// is looked up under `w*16 + (1 << b)`: the bit's mask, not its index.
/// Existing fault tables are keyed this way, so the key scheme stays.
pub fn decode_fault_bits(words: &[u16], table: &CodeTable) -> String {
    let mut faults = Vec::new();
    for (word_index, word) in words.iter().enumerate() {
        let base = (word_index * 16) as u32;
        for bit in 0..16u32 {
            let mask = 1u32 << bit;
            if u32::from(*word) & mask == 0 {
                continue;
            }
            let label = format!("F{:02}", base + bit + 1);
            let entry = match table.get(&(base + mask)) {
                Some(description) => format!("{} {}", label, description),
                None => label,
            };
            faults.push(entry.trim().to_string());
        }
    }

    if faults.is_empty() {
        NO_ERRORS.to_string()
    } else {
        faults.join(", ")
    }
}

fn assemble(words: &[u16], order: WordOrder) -> u64 {
    match order {
        WordOrder::HighFirst => words
            .iter()
            .fold(0u64, |acc, w| (acc << 16) | u64::from(*w)),
        WordOrder::LowFirst => words
            .iter()
            .rev()
            .fold(0u64, |acc, w| (acc << 16) | u64::from(*w)),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// One field that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFailure {
    pub name: String,
    pub error: DecodeError,
}

/// Output of one decode pass
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub values: BTreeMap<String, MetricValue>,
    pub failures: Vec<FieldFailure>,
}

/// Catalog-driven decoder with its lookup tables injected at construction
#[derive(Debug, Clone)]
pub struct DecodeEngine {
    tables: LookupTables,
}

impl DecodeEngine {
    pub fn new(tables: LookupTables) -> Self {
        Self { tables }
    }

    /// Fail when the catalog references a table this engine does not hold
    pub fn check_catalog(&self, catalog: &RegisterCatalog) -> Result<()> {
        for (name, spec) in catalog.iter() {
            if let Some(table) = spec.decoder.table() {
                if self.tables.get(table).is_none() {
                    return Err(InvSrvError::catalog(format!(
                        "{}: unknown table '{}'",
                        name, table
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decode every catalog entry that the block can satisfy
    pub fn decode(&self, raw: &RawRegisterBlock, catalog: &RegisterCatalog) -> Decoded {
        let mut decoded = Decoded::default();

        for (name, spec) in catalog.iter() {
            match self.decode_field(raw, spec) {
                Ok(value) => {
                    debug!(
                        "Decoded register {} ({}): {} {}",
                        spec.id, name, value, spec.unit
                    );
                    decoded.values.insert(
                        name.to_string(),
                        MetricValue {
                            name: name.to_string(),
                            unit: spec.unit.clone(),
                            value,
                        },
                    );
                },
                Err(error) => {
                    warn!("Skipping register {} ({}): {}", spec.id, name, error);
                    decoded.failures.push(FieldFailure {
                        name: name.to_string(),
                        error,
                    });
                },
            }
        }

        decoded
    }

    /// Decode one entry, applying scale/offset/rounding to numeric ones
    pub fn decode_field(
        &self,
        raw: &RawRegisterBlock,
        spec: &RegisterSpec,
    ) -> std::result::Result<Value, DecodeError> {
        let words = raw
            .slice(spec.id, spec.span)
            .ok_or(DecodeError::OutOfRange {
                start: u32::from(spec.id),
                end: spec.last_register(),
                available: raw.len(),
            })?;

        let decoded = self.apply_decoder(&spec.decoder, words)?;

        if spec.is_numeric() {
            let scalar = match decoded {
                Value::Number(v) => v,
                Value::Text(text) => return Err(DecodeError::NotNumeric(text)),
            };
            let mut result = scalar * spec.scale + spec.offset;
            if spec.round_to_int {
                // f64::round rounds half away from zero
                result = result.round();
            }
            Ok(Value::Number(result))
        } else {
            Ok(match decoded {
                Value::Number(v) => Value::Text(format_number(v)),
                text => text,
            })
        }
    }

    fn apply_decoder(
        &self,
        decoder: &Decoder,
        words: &[u16],
    ) -> std::result::Result<Value, DecodeError> {
        if let Some(expected) = decoder.fixed_span() {
            if words.len() != usize::from(expected) {
                return Err(DecodeError::WrongLength {
                    expected: usize::from(expected),
                    actual: words.len(),
                });
            }
        }

        match decoder {
            Decoder::Identity => Ok(Value::Number(f64::from(words[0]))),
            Decoder::Scale { order } => Ok(Value::Number(assemble(words, *order) as f64)),
            Decoder::Bitmask { table } => {
                let table = self.table(table)?;
                Ok(Value::Text(decode_fault_bits(words, table)))
            },
            Decoder::Lookup { table: name } => {
                let table = self.table(name)?;
                let code = words[0];
                table
                    .get(&u32::from(code))
                    .map(|text| Value::Text(text.clone()))
                    .ok_or_else(|| DecodeError::UnknownCode {
                        table: name.clone(),
                        code,
                    })
            },
        }
    }

    fn table(&self, name: &str) -> std::result::Result<&CodeTable, DecodeError> {
        self.tables
            .get(name)
            .ok_or_else(|| DecodeError::UnknownTable(name.to_string()))
    }
}

impl Default for DecodeEngine {
    fn default() -> Self {
        Self::new(LookupTables::deye())
    }
}
