//! Compile-side errors.
//!
//! Parse errors carry a 1-based source location and the remainder of the
//! offending line; the CLI prefixes them with the file name to produce
//! `<file>:<line>: error: parse error at '<fragment>'`. Semantic errors are
//! single-line diagnostics in the classic tool's wording.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("parse error at '{fragment}'")]
    Parse {
        line: usize,
        column: usize,
        fragment: String,
    },

    #[error("item '{0}' defined twice")]
    DuplicateDevice(String),

    #[error("device id {0} is out of range")]
    DeviceIdRange(i64),

    #[error("type level {0} is out of range")]
    TypeLevelRange(i64),

    #[error("device id {0} already in use")]
    DuplicateDeviceId(i64),

    #[error("bucket or device '{0}' is already defined")]
    DuplicateItem(String),

    #[error("bucket type '{0}' is not defined")]
    UnknownType(String),

    #[error("bucket '{0}' is not at a level above its items (type level must be positive)")]
    BucketAtDeviceLevel(String),

    #[error("bucket '{0}' has no alg clause")]
    MissingAlg(String),

    #[error("unknown bucket alg '{0}'")]
    UnknownAlg(String),

    #[error("bucket id {0} defined twice")]
    DuplicateBucketId(i64),

    #[error("bucket '{bucket}' has illegal id {id} (bucket ids are negative)")]
    BucketIdNotNegative { bucket: String, id: i64 },

    #[error("item '{item}' in bucket '{bucket}' is not defined")]
    UnknownItem { bucket: String, item: String },

    #[error("item '{item}' in bucket '{bucket}' has explicit pos {pos}, which is occupied")]
    PosOccupied {
        bucket: String,
        item: String,
        pos: i64,
    },

    #[error("item '{item}' in bucket '{bucket}' has illegal pos {pos}")]
    IllegalPos {
        bucket: String,
        item: String,
        pos: i64,
    },

    #[error("item '{item}' in bucket '{bucket}' is listed twice")]
    DuplicateBucketItem { bucket: String, item: String },

    #[error("item '{item}' in bucket '{bucket}' has illegal weight {value}")]
    IllegalWeight {
        bucket: String,
        item: String,
        value: f64,
    },

    #[error("illegal device offload {value} on device {id} {name} (valid range is [0,1])")]
    IllegalOffload { id: i64, name: String, value: f64 },

    #[error("rule name '{0}' already defined")]
    DuplicateRuleName(String),

    #[error("unknown rule type '{0}'")]
    UnknownRuleType(String),

    #[error("rule '{rule}' {field} {value} out of range (0..=255)")]
    RuleMaskRange {
        rule: String,
        field: &'static str,
        value: i64,
    },

    #[error("in rule '{rule}' step argument {value} out of range")]
    StepArgRange { rule: String, value: i64 },

    #[error("in rule '{rule}' item '{item}' not defined")]
    UnknownStepItem { rule: String, item: String },

    #[error("in rule '{rule}' type '{type_name}' not defined")]
    UnknownStepType { rule: String, type_name: String },

    #[error(transparent)]
    Map(#[from] crush::CrushError),
}

impl CompileError {
    /// Source line of a location-tagged error
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Parse { line, .. } => Some(*line),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
