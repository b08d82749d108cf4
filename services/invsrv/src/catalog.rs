//! Register catalog
//!
//! Static table of the measurements the service knows how to decode. Each
//! entry names a register range on the device and the strategy used to turn
//! the raw words into a value. The catalog is built once at startup and is
//! immutable afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InvSrvError, Result};

/// Word order for values spread across several registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Most significant word at the lowest address
    HighFirst,
    /// Least significant word at the lowest address
    #[default]
    LowFirst,
}

/// Decode strategy attached to a catalog entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decoder {
    /// Single word, returned verbatim
    #[default]
    Identity,
    /// Unsigned integer assembled from `span` words (1..=4)
    Scale {
        #[serde(default)]
        order: WordOrder,
    },
    /// Fault bits across `span` words, described through a fault table
    Bitmask { table: String },
    /// Single word mapped to text through a lookup table
    Lookup { table: String },
}

/// Widest value the `Scale` decoder can assemble
pub const MAX_SCALE_WORDS: u16 = 4;

impl Decoder {
    /// Span the decoder requires, if it only accepts one
    pub fn fixed_span(&self) -> Option<u16> {
        match self {
            Decoder::Identity | Decoder::Lookup { .. } => Some(1),
            Decoder::Scale { .. } | Decoder::Bitmask { .. } => None,
        }
    }

    /// Name of the table the decoder reads from
    pub fn table(&self) -> Option<&str> {
        match self {
            Decoder::Bitmask { table } | Decoder::Lookup { table } => Some(table),
            Decoder::Identity | Decoder::Scale { .. } => None,
        }
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_span() -> u16 {
    1
}

/// One cataloged measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    /// First register address
    pub id: u16,
    /// Unit; empty for status/text values
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Round the scaled value to the nearest integer (ties away from zero)
    #[serde(default)]
    pub round_to_int: bool,
    /// Number of consecutive registers consumed
    #[serde(default = "default_span")]
    pub span: u16,
    #[serde(default)]
    pub decoder: Decoder,
}

impl RegisterSpec {
    /// Single-register numeric (or, with an empty unit, status) entry
    pub fn new(id: u16, unit: impl Into<String>) -> Self {
        Self {
            id,
            unit: unit.into(),
            scale: default_scale(),
            offset: 0.0,
            round_to_int: false,
            span: default_span(),
            decoder: Decoder::Identity,
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn rounded(mut self) -> Self {
        self.round_to_int = true;
        self
    }

    pub fn span(mut self, span: u16) -> Self {
        self.span = span;
        self
    }

    pub fn decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Numeric measurements carry a unit
    pub fn is_numeric(&self) -> bool {
        !self.unit.is_empty()
    }

    /// Last register address touched by this entry
    pub fn last_register(&self) -> u32 {
        u32::from(self.id) + u32::from(self.span.max(1)) - 1
    }

    fn overlaps(&self, other: &RegisterSpec) -> bool {
        u32::from(self.id) <= other.last_register() && u32::from(other.id) <= self.last_register()
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.span == 0 {
            return Err(InvSrvError::catalog(format!("{}: span must be at least 1", name)));
        }
        if self.last_register() > u32::from(u16::MAX) {
            return Err(InvSrvError::catalog(format!(
                "{}: registers {}..{} exceed the address space",
                name,
                self.id,
                self.last_register()
            )));
        }
        if let Some(required) = self.decoder.fixed_span() {
            if self.span != required {
                return Err(InvSrvError::catalog(format!(
                    "{}: decoder {:?} needs span {}, got {}",
                    name, self.decoder, required, self.span
                )));
            }
        }
        if matches!(self.decoder, Decoder::Scale { .. }) && self.span > MAX_SCALE_WORDS {
            return Err(InvSrvError::catalog(format!(
                "{}: scale decoder supports at most {} words, got {}",
                name, MAX_SCALE_WORDS, self.span
            )));
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(InvSrvError::catalog(format!(
                "{}: scale and offset must be finite",
                name
            )));
        }
        Ok(())
    }
}

/// Mapping from measurement name to register spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterCatalog {
    entries: BTreeMap<String, RegisterSpec>,
}

impl RegisterCatalog {
    /// Build and validate a catalog; duplicate names are rejected
    pub fn new<I, N>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, RegisterSpec)>,
        N: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (name, spec) in entries {
            let name = name.into();
            if map.insert(name.clone(), spec).is_some() {
                return Err(InvSrvError::catalog(format!("duplicate entry: {}", name)));
            }
        }
        let catalog = Self { entries: map };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a YAML register map (`name: {id, unit, ...}`)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let catalog: RegisterCatalog = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            InvSrvError::config(format!("cannot read register map {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check entry shapes and that overlapping ranges agree on the decoder
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(InvSrvError::catalog("catalog has no registers"));
        }

        for (name, spec) in &self.entries {
            spec.check(name)?;
        }

        let specs: Vec<(&String, &RegisterSpec)> = self.entries.iter().collect();
        for (i, (name_a, a)) in specs.iter().enumerate() {
            for (name_b, b) in &specs[i + 1..] {
                if a.overlaps(b) && a.decoder != b.decoder {
                    return Err(InvSrvError::catalog(format!(
                        "{} and {} share registers with conflicting decoders",
                        name_a, name_b
                    )));
                }
            }
        }
        Ok(())
    }

    /// Largest first-register address across all entries
    pub fn max_register_id(&self) -> u16 {
        self.entries.values().map(|s| s.id).max().unwrap_or(0)
    }

    /// Largest register address any entry touches, spans included
    pub fn highest_register(&self) -> u16 {
        let last = self
            .entries
            .values()
            .map(RegisterSpec::last_register)
            .max()
            .unwrap_or(0);
        u16::try_from(last).unwrap_or(u16::MAX)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterSpec)> {
        self.entries.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn get(&self, name: &str) -> Option<&RegisterSpec> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lookup table holding Deye run states
pub const INVERTER_STATE_TABLE: &str = "inverter_state";
/// Lookup table holding grid relay states
pub const GRID_CONNECTION_TABLE: &str = "grid_connection";
/// Fault table used by the bitmask decoder
pub const FAULT_TABLE: &str = "faults";

/// Register map of single-phase Deye hybrid inverters
pub fn deye_catalog() -> RegisterCatalog {
    let lookup = |table: &str| Decoder::Lookup {
        table: table.to_string(),
    };

    let entries = [
        ("battery_temperature", RegisterSpec::new(182, "C").scale(0.1).offset(-100.0)),
        ("battery_voltage", RegisterSpec::new(183, "V").scale(0.01)),
        ("battery_soc", RegisterSpec::new(184, "%")),
        ("battery_charge_limit", RegisterSpec::new(314, "A")),
        ("battery_dischage_limit", RegisterSpec::new(315, "A")),
        ("grid_frequency", RegisterSpec::new(79, "Hz").scale(0.01)),
        ("grid_power", RegisterSpec::new(169, "W").scale(-1.0)),
        ("grid_ld_power", RegisterSpec::new(167, "W").scale(-1.0)),
        ("grid_l2_power", RegisterSpec::new(168, "W").scale(-1.0)),
        ("grid_voltage", RegisterSpec::new(150, "V").scale(0.1).rounded()),
        ("grid_current", RegisterSpec::new(160, "A").scale(0.01).rounded()),
        ("grid_ct_power", RegisterSpec::new(172, "W").scale(-1.0)),
        ("load_power", RegisterSpec::new(178, "W")),
        ("load_l1_power", RegisterSpec::new(176, "W")),
        ("load_l2_power", RegisterSpec::new(177, "W")),
        ("load_frequency", RegisterSpec::new(192, "Hz").scale(0.01)),
        ("overall_state", RegisterSpec::new(59, "").decoder(lookup(INVERTER_STATE_TABLE))),
        (
            "fault_state",
            RegisterSpec::new(103, "").span(4).decoder(Decoder::Bitmask {
                table: FAULT_TABLE.to_string(),
            }),
        ),
        ("grid_connection", RegisterSpec::new(194, "").decoder(lookup(GRID_CONNECTION_TABLE))),
    ];

    RegisterCatalog {
        entries: entries
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deye_catalog_is_valid() {
        let catalog = deye_catalog();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.len(), 19);
        assert_eq!(catalog.max_register_id(), 315);
        assert_eq!(catalog.highest_register(), 315);
    }

    #[test]
    fn test_deye_catalog_has_no_conflicting_overlaps() {
        let catalog = deye_catalog();
        let specs: Vec<_> = catalog.iter().collect();
        for (i, (name_a, a)) in specs.iter().enumerate() {
            for (name_b, b) in &specs[i + 1..] {
                if a.overlaps(b) {
                    assert_eq!(a.decoder, b.decoder, "{} overlaps {}", name_a, name_b);
                }
            }
        }
    }

    #[test]
    fn test_highest_register_includes_span() {
        let catalog = RegisterCatalog::new([
            ("a", RegisterSpec::new(10, "V")),
            (
                "faults",
                RegisterSpec::new(12, "").span(4).decoder(Decoder::Bitmask {
                    table: FAULT_TABLE.into(),
                }),
            ),
        ])
        .unwrap();
        assert_eq!(catalog.max_register_id(), 12);
        assert_eq!(catalog.highest_register(), 15);
    }

    #[test]
    fn test_conflicting_overlap_rejected() {
        let result = RegisterCatalog::new([
            (
                "faults",
                RegisterSpec::new(100, "").span(4).decoder(Decoder::Bitmask {
                    table: FAULT_TABLE.into(),
                }),
            ),
            ("state", RegisterSpec::new(102, "").decoder(Decoder::Lookup {
                table: INVERTER_STATE_TABLE.into(),
            })),
        ]);
        assert!(matches!(result, Err(InvSrvError::CatalogError(_))));
    }

    #[test]
    fn test_same_decoder_overlap_allowed() {
        let catalog = RegisterCatalog::new([
            ("voltage_raw", RegisterSpec::new(150, "V")),
            ("voltage_rounded", RegisterSpec::new(150, "V").scale(0.1).rounded()),
        ]);
        assert!(catalog.is_ok());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = RegisterCatalog::new([
            ("soc", RegisterSpec::new(184, "%")),
            ("soc", RegisterSpec::new(185, "%")),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_shape_errors() {
        assert!(RegisterCatalog::new([("a", RegisterSpec::new(1, "V").span(2))]).is_err());
        assert!(RegisterCatalog::new([("a", RegisterSpec::new(1, "V").span(0))]).is_err());
        assert!(RegisterCatalog::new([(
            "a",
            RegisterSpec::new(1, "Wh")
                .span(5)
                .decoder(Decoder::Scale { order: WordOrder::LowFirst })
        )])
        .is_err());
        assert!(RegisterCatalog::new([(
            "a",
            RegisterSpec::new(u16::MAX, "Wh")
                .span(2)
                .decoder(Decoder::Scale { order: WordOrder::LowFirst })
        )])
        .is_err());
        assert!(RegisterCatalog::new(Vec::<(String, RegisterSpec)>::new()).is_err());
    }

    #[test]
    fn test_yaml_register_map() {
        let yaml = r#"
battery_soc:
  id: 184
  unit: "%"
total_energy:
  id: 96
  unit: kWh
  scale: 0.1
  span: 2
  decoder:
    kind: scale
    order: low_first
overall_state:
  id: 59
  decoder:
    kind: lookup
    table: inverter_state
"#;
        let catalog = RegisterCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(catalog.len(), 3);

        let soc = catalog.get("battery_soc").unwrap();
        assert_eq!(soc.scale, 1.0);
        assert_eq!(soc.span, 1);
        assert_eq!(soc.decoder, Decoder::Identity);

        let energy = catalog.get("total_energy").unwrap();
        assert_eq!(energy.decoder, Decoder::Scale { order: WordOrder::LowFirst });
        assert_eq!(energy.last_register(), 97);

        let state = catalog.get("overall_state").unwrap();
        assert!(!state.is_numeric());
        assert_eq!(state.decoder.table(), Some("inverter_state"));
    }

    #[test]
    fn test_yaml_register_map_is_validated() {
        let yaml = r#"
bad:
  id: 10
  unit: V
  span: 3
"#;
        assert!(RegisterCatalog::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_serialized_catalog_round_trips_through_yaml() {
        let catalog = deye_catalog();
        let yaml = serde_yaml::to_string(&catalog).unwrap();
        assert_eq!(RegisterCatalog::from_yaml_str(&yaml).unwrap(), catalog);
    }
}
