//! Feature normalization
//!
//! Raw OSM-style tagged geometries are classified into a small set of canonical categories,
//! clipped to the corridor, stripped down to the attributes the map needs, and given the zoom
//! range in which they are drawn.

use crate::config::{CategoryZooms, Config, ZoomRange};
use crate::{Corridor, PackError, utils};

use geo::{CoordsIter, Geometry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical feature category.
///
/// Declaration order is the drawing priority inside a tile: area fills first, then water,
/// buildings and linework, with labels-only features last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Landcover,
    Boundary,
    Hydrography,
    Building,
    Rail,
    Road,
    Trail,
    Poi,
    Peak,
}

impl Category {
    /// Ordering key inside a tile, lower draws first
    #[inline]
    pub fn priority(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Landcover => "landcover",
            Category::Boundary => "boundary",
            Category::Hydrography => "hydrography",
            Category::Building => "building",
            Category::Rail => "rail",
            Category::Road => "road",
            Category::Trail => "trail",
            Category::Poi => "poi",
            Category::Peak => "peak",
        }
    }

    /// Categories that feed the routing graph
    #[inline]
    pub fn is_routable(self) -> bool {
        matches!(self, Category::Road | Category::Trail)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Interpret an OSM tag value: yes/no/true/false as booleans, numeric strings as numbers
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "yes" | "true" => return AttributeValue::Bool(true),
            "no" | "false" => return AttributeValue::Bool(false),
            _ => {}
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return AttributeValue::Int(int);
        }
        match trimmed.parse::<f64>() {
            Ok(float) if float.is_finite() => AttributeValue::Float(float),
            _ => AttributeValue::Text(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Bool(b) => serde_json::Value::from(*b),
            AttributeValue::Int(i) => serde_json::Value::from(*i),
            AttributeValue::Float(f) => serde_json::Value::from(*f),
            AttributeValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Tags carried over from the raw feature
const KEPT_TAGS: &[&str] = &[
    "name",
    "highway",
    "surface",
    "ref",
    "ele",
    "sac_scale",
    "oneway",
    "waterway",
    "natural",
    "landuse",
    "leisure",
    "boundary",
    "railway",
    "building",
    "amenity",
    "tourism",
];

/// Tags whose values stay text even when they look numeric
const TEXT_TAGS: &[&str] = &["name", "ref"];

/// Raw OSM-style feature as handed over by the downloader
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    pub id: u64,
    pub geometry: Geometry<f64>,
    pub tags: BTreeMap<String, String>,
    /// Relations this feature is a member of
    pub relations: Vec<u64>,
}

impl RawFeature {
    pub fn new(id: u64, geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            id,
            geometry: geometry.into(),
            tags: BTreeMap::new(),
            relations: Vec::new(),
        }
    }

    /// Builder-style helper to add a tag
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn has_tag(&self, key: &str) -> bool {
        self.tag(key).is_some_and(|v| v != "no")
    }

    fn tag_in(&self, key: &str, values: &[&str]) -> bool {
        self.tag(key).is_some_and(|v| values.contains(&v))
    }
}

/// Normalized, immutable feature
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub category: Category,
    pub geometry: Geometry<f64>,
    pub attributes: Attributes,
    pub zoom_range: ZoomRange,
}

impl Feature {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.attribute(key).and_then(AttributeValue::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.text("name")
    }

    pub fn is_main_trail(&self) -> bool {
        self.attribute("main_trail")
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    pub fn is_oneway(&self) -> bool {
        match self.attribute("oneway") {
            Some(AttributeValue::Bool(b)) => *b,
            Some(AttributeValue::Int(1)) => true,
            _ => false,
        }
    }

    /// Whether the geometry carries any line work
    pub fn has_lines(&self) -> bool {
        fn lines(g: &Geometry<f64>) -> bool {
            match g {
                Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => true,
                Geometry::GeometryCollection(gc) => gc.0.iter().any(lines),
                _ => false,
            }
        }
        lines(&self.geometry)
    }
}

const ROAD_HIGHWAYS: &[&str] = &[
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "residential",
    "service",
    "unclassified",
    "motorway_link",
    "trunk_link",
    "primary_link",
    "secondary_link",
    "tertiary_link",
];

const TRAIL_HIGHWAYS: &[&str] = &[
    "path",
    "track",
    "footway",
    "cycleway",
    "bridleway",
    "steps",
    "via_ferrata",
];

const RAILWAYS: &[&str] = &["rail", "tram", "light_rail", "narrow_gauge", "funicular"];

const WATERWAYS: &[&str] = &["river", "stream", "canal", "drain"];

/// Map raw tags to a category, `None` for features the map does not draw
pub fn classify(raw: &RawFeature) -> Option<Category> {
    if raw.tag("golf") == Some("cartpath") {
        return None;
    }

    let is_point = matches!(raw.geometry, Geometry::Point(_) | Geometry::MultiPoint(_));

    if is_point && raw.tag("natural") == Some("peak") {
        return Some(Category::Peak);
    }
    if raw.tag_in("highway", ROAD_HIGHWAYS) {
        return Some(Category::Road);
    }
    if raw.tag_in("highway", TRAIL_HIGHWAYS)
        || raw.tag("route") == Some("hiking")
        || raw.tag("trail") == Some("yes")
        || raw.tag_in("hiking", &["yes", "designated"])
        || raw.tag_in("mtb", &["yes", "designated"])
    {
        return Some(Category::Trail);
    }
    if raw.tag_in("railway", RAILWAYS) {
        return Some(Category::Rail);
    }
    if raw.has_tag("building") {
        return Some(Category::Building);
    }
    if raw.tag_in("waterway", WATERWAYS)
        || raw.tag("natural") == Some("water")
        || raw.has_tag("wetland")
        || raw.has_tag("intermittent")
    {
        return Some(Category::Hydrography);
    }
    if raw.tag_in("leisure", &["park", "nature_reserve"])
        || raw.tag_in("boundary", &["national_park", "protected_area"])
        || raw.has_tag("protected_area")
    {
        return Some(Category::Boundary);
    }
    if raw.tag("landuse") == Some("forest") || raw.tag("natural") == Some("wood") {
        return Some(Category::Landcover);
    }
    if raw.has_tag("amenity") || raw.has_tag("tourism") || raw.has_tag("shelter") {
        return Some(Category::Poi);
    }
    if is_point && raw.tag("name").is_some() {
        return Some(Category::Poi);
    }
    None
}

/// First reference of a multi-ref, e.g. `"VT 30;US 4"` gives `"VT 30"`
fn primary_ref(reference: &str) -> &str {
    reference.split(';').next().unwrap_or_default().trim()
}

/// Length of a leading network prefix (`I`, `US` or a two-letter state code)
fn network_prefix_len(primary: &str) -> Option<usize> {
    let bytes = primary.as_bytes();
    let letters = if bytes.first() == Some(&b'I')
        && bytes.get(1).is_some_and(u8::is_ascii_whitespace)
    {
        1
    } else if bytes.len() > 2
        && bytes[0].is_ascii_uppercase()
        && bytes[1].is_ascii_uppercase()
        && bytes[2].is_ascii_whitespace()
    {
        2
    } else {
        return None;
    };
    Some(letters)
}

/// Shield network of a road reference
pub fn derive_network(reference: &str) -> Option<&'static str> {
    let primary = primary_ref(reference);
    if primary.is_empty() {
        return None;
    }
    if primary.starts_with("I ") {
        return Some("us-interstate");
    }
    if primary.starts_with("US ") {
        return Some("us-highway");
    }
    if network_prefix_len(primary) == Some(2)
        && primary[2..].trim_start().starts_with(|c: char| c.is_ascii_digit())
    {
        return Some("us-state");
    }
    Some("road")
}

/// Reference number without its network prefix, e.g. `"VT 30"` gives `"30"`
pub fn clean_ref(reference: &str) -> String {
    let primary = primary_ref(reference);
    match network_prefix_len(primary) {
        Some(len) => primary[len..].trim().to_string(),
        None => primary.to_string(),
    }
}

/// Shield width in characters, `None` for an empty reference
pub fn ref_length(cleaned: &str) -> Option<i64> {
    let length = cleaned.chars().count();
    (length > 0).then_some(length as i64)
}

/// Outcome of normalizing a single raw feature
enum Outcome {
    Kept(Feature),
    Unclassified,
    Outside,
    OutOfZoom,
    Invalid { feature_id: u64, reason: String },
}

/// Counts of what happened to the raw input
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub input: usize,
    pub kept: usize,
    pub unclassified: usize,
    pub outside_corridor: usize,
    pub out_of_zoom: usize,
    pub duplicates: usize,
    /// Malformed features, skipped
    pub warnings: Vec<PackError>,
}

/// Normalized features sorted by `(id, category)`, plus the report
#[derive(Debug, Default)]
pub struct NormalizedFeatures {
    pub features: Vec<Feature>,
    pub report: NormalizeReport,
}

impl NormalizedFeatures {
    pub fn routable(&self) -> impl Iterator<Item = &Feature> {
        self.features
            .iter()
            .filter(|f| f.category.is_routable() && f.has_lines())
    }

    pub fn count_by_category(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for feature in &self.features {
            *counts.entry(feature.category).or_insert(0) += 1;
        }
        counts
    }
}

/// Turns raw tagged geometries into canonical [`Feature`]s
#[derive(Debug, Clone)]
pub struct FeatureNormalizer {
    zooms: CategoryZooms,
    global: ZoomRange,
    trail_id: Option<u64>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl FeatureNormalizer {
    pub fn new(config: &Config) -> Self {
        Self {
            zooms: config.category_zooms.clone(),
            global: config.zoom,
            trail_id: config.trail_id,
        }
    }

    /// Normalize every raw feature against the corridor.
    ///
    /// Features are processed in parallel; the output is sorted by `(id, category)` and
    /// deduplicated so that the result does not depend on input order or thread scheduling.
    pub fn normalize(&self, raw: &[RawFeature], corridor: &Corridor) -> NormalizedFeatures {
        #[cfg(feature = "profiling")]
        profiling::scope!("normalizer::normalize");

        let outcomes: Vec<Outcome> = raw
            .par_iter()
            .map(|feature| self.normalize_one(feature, corridor))
            .collect();

        let mut report = NormalizeReport {
            input: raw.len(),
            ..Default::default()
        };
        let mut features = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Kept(feature) => features.push(feature),
                Outcome::Unclassified => report.unclassified += 1,
                Outcome::Outside => report.outside_corridor += 1,
                Outcome::OutOfZoom => report.out_of_zoom += 1,
                Outcome::Invalid { feature_id, reason } => {
                    let err = PackError::FeatureClip { feature_id, reason };
                    tracing::warn!("{}", err);
                    report.warnings.push(err);
                }
            }
        }

        features.sort_by(|a, b| (a.id, a.category).cmp(&(b.id, b.category)));
        let before = features.len();
        features.dedup_by(|a, b| a.id == b.id && a.category == b.category);
        report.duplicates = before - features.len();
        report.kept = features.len();

        tracing::info!(
            "Normalized {} of {} raw features ({} unclassified, {} outside corridor, {} hidden at all zooms, {} skipped, {} duplicates)",
            report.kept,
            report.input,
            report.unclassified,
            report.outside_corridor,
            report.out_of_zoom,
            report.warnings.len(),
            report.duplicates
        );

        NormalizedFeatures { features, report }
    }

    fn normalize_one(&self, raw: &RawFeature, corridor: &Corridor) -> Outcome {
        let Some(category) = classify(raw) else {
            return Outcome::Unclassified;
        };

        if let Some(bad) = raw.geometry.coords_iter().find(|c| !utils::is_valid_lon_lat(*c)) {
            return Outcome::Invalid {
                feature_id: raw.id,
                reason: format!("invalid coordinate ({}, {})", bad.x, bad.y),
            };
        }
        if raw.geometry.coords_count() == 0 {
            return Outcome::Invalid {
                feature_id: raw.id,
                reason: "empty geometry".to_string(),
            };
        }

        let Some(zoom_range) = self.zooms.range_for(category, self.global) else {
            return Outcome::OutOfZoom;
        };

        let Some(geometry) = corridor.clip(&raw.geometry) else {
            return Outcome::Outside;
        };

        Outcome::Kept(Feature {
            id: raw.id,
            category,
            geometry,
            attributes: self.attributes(raw, category),
            zoom_range,
        })
    }

    fn attributes(&self, raw: &RawFeature, category: Category) -> Attributes {
        let mut attributes = Attributes::new();
        for key in KEPT_TAGS {
            if let Some(value) = raw.tag(key) {
                let value = if TEXT_TAGS.contains(key) {
                    AttributeValue::Text(value.to_string())
                } else {
                    AttributeValue::parse(value)
                };
                attributes.insert(key.to_string(), value);
            }
        }

        if category == Category::Road
            && let Some(reference) = raw.tag("ref")
            && let Some(network) = derive_network(reference)
        {
            let cleaned = clean_ref(reference);
            if let Some(length) = ref_length(&cleaned) {
                attributes.insert("ref_length".to_string(), AttributeValue::Int(length));
            }
            attributes.insert("ref".to_string(), AttributeValue::Text(cleaned));
            attributes.insert(
                "network".to_string(),
                AttributeValue::Text(network.to_string()),
            );
        }

        let in_main_relation = self
            .trail_id
            .is_some_and(|trail_id| raw.relations.contains(&trail_id));
        if category.is_routable() && (in_main_relation || raw.tag("main_trail") == Some("yes")) {
            attributes.insert("main_trail".to_string(), AttributeValue::Bool(true));
        }

        attributes
    }
}
