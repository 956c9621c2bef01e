//! IEI risk scoring engine.
//!
//! Converts questionnaire answers into the composite IEI index:
//!
//! 1. Every expected question is resolved to an [`AnswerKey`]; missing or
//!    unrecognized answers fall back to `U` and are counted separately.
//! 2. Per-question scores are averaged per [`Block`].
//! 3. Block means feed the robbery (`ieiR`) and occupation (`ieiO`) formulas,
//!    blended into `ieiTotal` with the property type's [`WeightTable`].
//! 4. A confidence score accounts for data quality, independent of the risk.
//!
//! The engine is a pure function: no I/O, no clock, no randomness.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Raw answers as submitted: question id -> answer key.
pub type AnswerMap = HashMap<String, String>;

/// Errors raised by the scoring engine. Only the property type can be invalid;
/// answer problems are absorbed into the confidence score.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("invalid property type '{0}': expected 'vivienda' or 'comercio'")]
    InvalidPropertyType(String),
}

/// Property being evaluated. Each type has its own question set and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Vivienda,
    Comercio,
}

impl PropertyType {
    pub const fn as_str(self) -> &'static str {
        match self {
            PropertyType::Vivienda => "vivienda",
            PropertyType::Comercio => "comercio",
        }
    }

    /// Question ids expected for this property type, common ones first.
    pub fn expected_questions(self) -> impl Iterator<Item = &'static (&'static str, Block)> {
        let specific: &'static [(&'static str, Block)] = match self {
            PropertyType::Vivienda => VIVIENDA_QUESTIONS,
            PropertyType::Comercio => COMERCIO_QUESTIONS,
        };
        COMMON_QUESTIONS.iter().chain(specific.iter())
    }

    pub fn weights(self) -> &'static WeightTable {
        match self {
            PropertyType::Vivienda => &VIVIENDA_WEIGHTS,
            PropertyType::Comercio => &COMERCIO_WEIGHTS,
        }
    }
}

impl FromStr for PropertyType {
    type Err = ScoringError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "vivienda" => Ok(PropertyType::Vivienda),
            "comercio" => Ok(PropertyType::Comercio),
            other => Err(ScoringError::InvalidPropertyType(other.to_string())),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thematic question groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Block {
    /// Environment / exposure
    E,
    /// Physical resistance and access
    R,
    /// Detection coverage
    D,
    /// Protection and response
    P,
    /// Habits
    H,
    /// Target attractiveness
    T,
    /// Occupancy signals
    O,
}

impl Block {
    pub const ALL: [Block; 7] = [
        Block::E,
        Block::R,
        Block::D,
        Block::P,
        Block::H,
        Block::T,
        Block::O,
    ];
}

const COMMON_QUESTIONS: &[(&str, Block)] = &[
    ("E1", Block::E),
    ("E2", Block::E),
    ("E3", Block::E),
    ("R4", Block::R),
    ("R5", Block::R),
    ("R6", Block::R),
    ("D7", Block::D),
    ("D8", Block::D),
    ("D9", Block::D),
    ("P10", Block::P),
    ("P11", Block::P),
    ("H12", Block::H),
    ("H13", Block::H),
];

const VIVIENDA_QUESTIONS: &[(&str, Block)] = &[
    ("O14V", Block::O),
    ("O15V", Block::O),
    ("O16V", Block::O),
    ("R17V", Block::R),
    ("H18V", Block::H),
];

const COMERCIO_QUESTIONS: &[(&str, Block)] = &[
    ("T14C", Block::T),
    ("T15C", Block::T),
    ("R16C", Block::R),
    ("D17C", Block::D),
    ("O18C", Block::O),
];

/// Normalized answer. `0..3` are increasing severity, `U` is "don't know".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnswerKey {
    Zero,
    One,
    Two,
    Three,
    Unknown,
}

impl AnswerKey {
    /// Recognize a raw answer key. Surrounding whitespace is tolerated.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(AnswerKey::Zero),
            "1" => Some(AnswerKey::One),
            "2" => Some(AnswerKey::Two),
            "3" => Some(AnswerKey::Three),
            "U" => Some(AnswerKey::Unknown),
            _ => None,
        }
    }

    pub const fn score(self) -> f64 {
        match self {
            AnswerKey::Zero => 0.0,
            AnswerKey::One => 0.33,
            AnswerKey::Two => 0.66,
            AnswerKey::Three => 1.0,
            AnswerKey::Unknown => 0.66,
        }
    }
}

/// Fixed weights for one property type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightTable {
    // Vr: robbery-axis vulnerability
    pub w_e: f64,
    pub w_r: f64,
    pub w_h: f64,
    pub w_t: f64,
    // Mr: robbery-axis protection
    pub w_d: f64,
    pub w_p: f64,
    // Vo: occupation-axis vulnerability
    pub v_e: f64,
    pub v_o: f64,
    pub v_h: f64,
    // Mo: occupation-axis protection
    pub u_d: f64,
    pub u_p: f64,
    // ieiTotal blend
    pub total_r: f64,
    pub total_o: f64,
}

pub const VIVIENDA_WEIGHTS: WeightTable = WeightTable {
    w_e: 0.18,
    w_r: 0.34,
    w_h: 0.18,
    w_t: 0.30,
    w_d: 0.55,
    w_p: 0.45,
    v_e: 0.25,
    v_o: 0.45,
    v_h: 0.30,
    u_d: 0.40,
    u_p: 0.60,
    total_r: 0.75,
    total_o: 0.25,
};

pub const COMERCIO_WEIGHTS: WeightTable = WeightTable {
    w_e: 0.15,
    w_r: 0.30,
    w_h: 0.20,
    w_t: 0.35,
    w_d: 0.50,
    w_p: 0.50,
    v_e: 0.20,
    v_o: 0.35,
    v_h: 0.45,
    u_d: 0.35,
    u_p: 0.65,
    total_r: 0.90,
    total_o: 0.10,
};

/// Risk band derived from `ieiTotal`. Upper bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 25.0 {
            RiskLevel::Low
        } else if score <= 50.0 {
            RiskLevel::Medium
        } else if score <= 75.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }

    /// Lenient parse used for stored and user-supplied labels, including the
    /// legacy Spanish band names.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match crate::validation::normalize_token(raw).as_str() {
            "low" | "bajo" | "baja" | "controlada" => Some(RiskLevel::Low),
            "medium" | "medio" | "media" | "moderada" => Some(RiskLevel::Medium),
            "high" | "alto" | "alta" | "elevada" => Some(RiskLevel::High),
            "critical" | "critico" | "critica" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RiskLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RiskLevel::parse_lenient(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown risk level '{}'", raw)))
    }
}

/// Raw intermediate quantities, exposed for audit and debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreDebug {
    pub property_type: PropertyType,
    #[serde(rename = "Vr")]
    pub vr: f64,
    #[serde(rename = "Mr")]
    pub mr: f64,
    #[serde(rename = "Vo")]
    pub vo: f64,
    #[serde(rename = "Mo")]
    pub mo: f64,
    pub iei_r_raw: f64,
    pub iei_o_raw: f64,
    pub iei_total_raw: f64,
    pub block_means: BTreeMap<Block, f64>,
    pub total_expected: usize,
    pub missing_count: usize,
    pub invalid_count: usize,
    pub unknown_count: usize,
    pub completion: f64,
    pub unknown_rate: f64,
    pub dirty_rate: f64,
    pub weights: WeightTable,
}

/// Output of [`compute_score`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub iei_r: u8,
    pub iei_o: u8,
    pub iei_total: u8,
    pub level: RiskLevel,
    pub subindexes: BTreeMap<Block, f64>,
    pub confidence: u8,
    pub debug: ScoreDebug,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

// mean([]) == 0: blocks without questions (T for vivienda) contribute nothing.
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn to_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Score raw answers for a property type given by its literal name.
///
/// Fails only when `property_type` is not `vivienda` or `comercio`.
pub fn compute_score(answers: &AnswerMap, property_type: &str) -> Result<ScoreResult, ScoringError> {
    let property_type = property_type.parse::<PropertyType>()?;
    Ok(score_answers(answers, property_type))
}

/// Score raw answers for an already validated property type.
pub fn score_answers(answers: &AnswerMap, property_type: PropertyType) -> ScoreResult {
    let mut by_block: BTreeMap<Block, Vec<f64>> = BTreeMap::new();
    let mut total_expected = 0usize;
    let mut missing_count = 0usize;
    let mut invalid_count = 0usize;
    let mut unknown_count = 0usize;

    for (question_id, block) in property_type.expected_questions() {
        total_expected += 1;
        let key = match answers.get(*question_id) {
            None => {
                missing_count += 1;
                AnswerKey::Unknown
            }
            Some(raw) => match AnswerKey::parse(raw) {
                Some(AnswerKey::Unknown) => {
                    unknown_count += 1;
                    AnswerKey::Unknown
                }
                Some(key) => key,
                None => {
                    invalid_count += 1;
                    AnswerKey::Unknown
                }
            },
        };
        by_block.entry(*block).or_default().push(key.score());
    }

    let block_means: BTreeMap<Block, f64> = Block::ALL
        .iter()
        .map(|block| {
            let scores = by_block.get(block).map(Vec::as_slice).unwrap_or(&[]);
            (*block, clamp01(mean(scores)))
        })
        .collect();
    let m = |block: Block| block_means.get(&block).copied().unwrap_or(0.0);
    let (e, r, d, p, h, t, o) = (
        m(Block::E),
        m(Block::R),
        m(Block::D),
        m(Block::P),
        m(Block::H),
        m(Block::T),
        m(Block::O),
    );

    let w = property_type.weights();

    // D and P are raw "insecurity" (0 = best), so (1 - D) and (1 - P) are protection.
    let vr = clamp01((w.w_e * e + w.w_r * r + w.w_h * h + w.w_t * t) / (w.w_e + w.w_r + w.w_h + w.w_t));
    let mr = clamp01((w.w_d * (1.0 - d) + w.w_p * (1.0 - p)) / (w.w_d + w.w_p));
    let vo = clamp01((w.v_e * e + w.v_o * o + w.v_h * h) / (w.v_e + w.v_o + w.v_h));
    let mo = clamp01((w.u_d * (1.0 - d) + w.u_p * (1.0 - p)) / (w.u_d + w.u_p));

    let iei_r = 100.0 * clamp01(0.15 + 0.85 * vr) * clamp01(0.35 + 0.65 * (1.0 - mr));
    let iei_o = 100.0 * clamp01(0.10 + 0.90 * vo) * clamp01(0.40 + 0.60 * (1.0 - mo));
    let iei_total = w.total_r * iei_r + w.total_o * iei_o;

    let total = total_expected as f64;
    let completion = (total - missing_count as f64) / total;
    let unknown_rate = unknown_count as f64 / total;
    let dirty_rate = (missing_count + invalid_count) as f64 / total;
    let confidence = 100.0 * clamp01(0.95 * completion - 0.35 * unknown_rate - 0.55 * dirty_rate);

    let subindexes = block_means
        .iter()
        .map(|(block, value)| (*block, round_to(*value, 2)))
        .collect();

    ScoreResult {
        iei_r: to_percent(iei_r),
        iei_o: to_percent(iei_o),
        iei_total: to_percent(iei_total),
        level: RiskLevel::from_score(iei_total),
        subindexes,
        confidence: to_percent(confidence),
        debug: ScoreDebug {
            property_type,
            vr,
            mr,
            vo,
            mo,
            iei_r_raw: iei_r,
            iei_o_raw: iei_o,
            iei_total_raw: iei_total,
            block_means,
            total_expected,
            missing_count,
            invalid_count,
            unknown_count,
            completion,
            unknown_rate,
            dirty_rate,
            weights: *w,
        },
    }
}
