use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrushError {
    #[error("Invalid bucket ID: {0}")]
    InvalidBucketId(i32),

    #[error("Invalid bucket algorithm: {0}")]
    InvalidBucketAlgorithm(u8),

    #[error("Invalid rule type: {0}")]
    InvalidRuleType(u8),

    #[error("Invalid rule step operation: {0}")]
    InvalidRuleOp(u32),

    #[error("Bucket not found: {0}")]
    BucketNotFound(i32),

    #[error("Bucket id {0} already in use")]
    BucketIdInUse(i32),

    #[error("Bucket {0}: summed weight overflows the 16.16 range")]
    WeightOverflow(i32),

    #[error("Rule not found: {0}")]
    RuleNotFound(u32),

    #[error("Item not found: {0}")]
    ItemNotFound(i32),

    #[error("Invalid offload value: {0:#x} (max 0x10000)")]
    InvalidOffload(u32),

    #[error("Duplicate name '{name}' for ids {first} and {second}")]
    DuplicateName {
        name: String,
        first: i32,
        second: i32,
    },

    #[error("Item {item} belongs to both bucket {first} and bucket {second}")]
    MultipleParents { item: i32, first: i32, second: i32 },

    #[error("Bucket {bucket} item {item}: level {item_level} is not below bucket level {bucket_level}")]
    LevelViolation {
        bucket: i32,
        item: i32,
        item_level: i32,
        bucket_level: i32,
    },

    #[error("Rule {0} has a CHOOSE step before any TAKE")]
    ChooseBeforeTake(u32),

    #[error("Rule {0} never emits")]
    MissingEmit(u32),

    #[error("Bucket {bucket}: stored weight {stored:#x} != summed weight {summed:#x}")]
    WeightMismatch {
        bucket: i32,
        stored: u32,
        summed: u32,
    },

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, CrushError>;
