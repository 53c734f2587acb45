use crate::{
    config::Config,
    converter::{CommandConverter, Converter},
    error::CatalogError,
    format::{Feature, Format},
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Preconditions {
    /// Tags that must all be present.
    pub requires: BTreeSet<Feature>,
    /// Tags that must all be absent.
    pub excludes: BTreeSet<Feature>,
}

impl Preconditions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requires.is_empty() && self.excludes.is_empty()
    }

    pub fn satisfied_by(&self, features: &BTreeSet<Feature>) -> bool {
        self.requires.is_subset(features) && self.excludes.is_disjoint(features)
    }
}

#[derive(Clone, Serialize)]
pub struct ConversionMethod {
    pub id: String,
    pub rank: u32,
    pub source_format: Format,
    pub target_format: Format,
    pub preconditions: Preconditions,
    #[serde(rename = "converter", serialize_with = "serialize_converter")]
    pub invoke: Arc<dyn Converter>,
}

fn serialize_converter<S: serde::Serializer>(
    c: &Arc<dyn Converter>,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(c.name())
}

impl fmt::Debug for ConversionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionMethod")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("source_format", &self.source_format)
            .field("target_format", &self.target_format)
            .field("preconditions", &self.preconditions)
            .field("converter", &self.invoke.name())
            .finish()
    }
}

impl ConversionMethod {
    pub fn new(
        id: impl Into<String>,
        rank: u32,
        source_format: Format,
        target_format: Format,
        invoke: Arc<dyn Converter>,
    ) -> Self {
        Self {
            id: id.into(),
            rank,
            source_format,
            target_format,
            preconditions: Preconditions::none(),
            invoke,
        }
    }

    pub fn requires(mut self, feature: Feature) -> Self {
        self.preconditions.requires.insert(feature);
        self
    }

    pub fn excludes(mut self, feature: Feature) -> Self {
        self.preconditions.excludes.insert(feature);
        self
    }
}

/// Read-only registry of conversion methods, in registration order.
#[derive(Debug, Clone, Default)]
pub struct MethodCatalog {
    methods: Vec<ConversionMethod>,
}

impl MethodCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Builds the catalog from `[converters.*]` and `[[methods]]`.
    pub fn from_config(cfg: &Config) -> Result<Self, CatalogError> {
        let converters: BTreeMap<&str, Arc<dyn Converter>> = cfg
            .converters
            .iter()
            .map(|(name, def)| {
                let c: Arc<dyn Converter> = Arc::new(CommandConverter::new(name, def));
                (name.as_str(), c)
            })
            .collect();

        let mut builder = Self::builder();
        for row in &cfg.methods {
            let parse_format = |value: &str| {
                value.parse::<Format>().map_err(|_| CatalogError::InvalidFormat {
                    method: row.id.clone(),
                    value: value.to_string(),
                })
            };
            let parse_features = |values: &[String]| {
                values
                    .iter()
                    .map(|v| {
                        v.parse::<Feature>()
                            .map_err(|_| CatalogError::InvalidPrecondition {
                                method: row.id.clone(),
                                value: v.clone(),
                            })
                    })
                    .collect::<Result<BTreeSet<_>, _>>()
            };

            let invoke = converters
                .get(row.converter.as_str())
                .cloned()
                .ok_or_else(|| CatalogError::UnknownConverter {
                    method: row.id.clone(),
                    converter: row.converter.clone(),
                })?;

            let mut method = ConversionMethod::new(
                row.id.clone(),
                row.rank,
                parse_format(&row.from)?,
                parse_format(&row.to)?,
                invoke,
            );
            method.preconditions = Preconditions {
                requires: parse_features(&row.requires)?,
                excludes: parse_features(&row.excludes)?,
            };
            builder = builder.register(method);
        }
        let catalog = builder.build()?;
        info!(
            "loaded {} conversion methods covering {} format pairs",
            catalog.len(),
            catalog.pairs().len()
        );
        Ok(catalog)
    }

    /// Eligible methods for a pair, ordered by rank then registration order.
    pub fn candidates(
        &self,
        source_format: Format,
        target_format: Format,
        features: &BTreeSet<Feature>,
    ) -> Vec<ConversionMethod> {
        let mut out: Vec<ConversionMethod> = self
            .methods
            .iter()
            .filter(|m| m.source_format == source_format && m.target_format == target_format)
            .filter(|m| m.preconditions.satisfied_by(features))
            .cloned()
            .collect();
        // Stable sort keeps registration order among equal ranks.
        out.sort_by_key(|m| m.rank);
        debug!(
            "candidates {source_format}->{target_format}: {:?}",
            out.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()
        );
        out
    }

    pub fn pairs(&self) -> BTreeSet<(Format, Format)> {
        self.methods
            .iter()
            .map(|m| (m.source_format, m.target_format))
            .collect()
    }

    pub fn methods(&self) -> &[ConversionMethod] {
        &self.methods
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[derive(Default)]
pub struct CatalogBuilder {
    methods: Vec<ConversionMethod>,
}

impl CatalogBuilder {
    pub fn register(mut self, method: ConversionMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Rejects duplicate ids and pairs lacking a method of last resort.
    pub fn build(self) -> Result<MethodCatalog, CatalogError> {
        let mut seen = HashSet::new();
        for m in &self.methods {
            if !seen.insert(m.id.as_str()) {
                return Err(CatalogError::DuplicateMethod(m.id.clone()));
            }
        }

        let catalog = MethodCatalog {
            methods: self.methods,
        };
        for (from, to) in catalog.pairs() {
            let has_last_resort = catalog.methods.iter().any(|m| {
                m.source_format == from && m.target_format == to && m.preconditions.is_empty()
            });
            if !has_last_resort {
                return Err(CatalogError::NoLastResort { from, to });
            }
        }
        Ok(catalog)
    }
}
