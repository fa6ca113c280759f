use std::collections::BTreeMap;

/// CRUSH bucket selection algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketAlgorithm {
    Uniform = 1,
    List = 2,
    Tree = 3,
    Straw = 4,
}

impl BucketAlgorithm {
    /// Name used by the DSL `alg` clause.
    pub fn name(&self) -> &'static str {
        match self {
            BucketAlgorithm::Uniform => "uniform",
            BucketAlgorithm::List => "list",
            BucketAlgorithm::Tree => "tree",
            BucketAlgorithm::Straw => "straw",
        }
    }
}

impl TryFrom<u8> for BucketAlgorithm {
    type Error = crate::error::CrushError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BucketAlgorithm::Uniform),
            2 => Ok(BucketAlgorithm::List),
            3 => Ok(BucketAlgorithm::Tree),
            4 => Ok(BucketAlgorithm::Straw),
            _ => Err(crate::error::CrushError::InvalidBucketAlgorithm(value)),
        }
    }
}

/// CRUSH rule families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuleType {
    Replicated = 1,
    Raid4 = 2,
}

impl TryFrom<u8> for RuleType {
    type Error = crate::error::CrushError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RuleType::Replicated),
            2 => Ok(RuleType::Raid4),
            _ => Err(crate::error::CrushError::InvalidRuleType(value)),
        }
    }
}

/// CRUSH rule operations
///
/// Opcode values are wire constants; 5 is historically unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuleOp {
    Noop = 0,
    Take = 1,
    ChooseFirstN = 2,
    ChooseIndep = 3,
    Emit = 4,
    ChooseLeafFirstN = 6,
    ChooseLeafIndep = 7,
}

impl TryFrom<u32> for RuleOp {
    type Error = crate::error::CrushError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RuleOp::Noop),
            1 => Ok(RuleOp::Take),
            2 => Ok(RuleOp::ChooseFirstN),
            3 => Ok(RuleOp::ChooseIndep),
            4 => Ok(RuleOp::Emit),
            6 => Ok(RuleOp::ChooseLeafFirstN),
            7 => Ok(RuleOp::ChooseLeafIndep),
            _ => Err(crate::error::CrushError::InvalidRuleOp(value)),
        }
    }
}

/// A single step in a CRUSH rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrushRuleStep {
    pub op: RuleOp,
    pub arg1: i32,
    pub arg2: i32,
}

/// Input-key mask for a rule: the pool it serves and the replica-count
/// range it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrushRuleMask {
    pub pool: u8,
    pub rule_type: RuleType,
    pub min_size: u8,
    pub max_size: u8,
}

/// A placement program: a mask plus an ordered step list
#[derive(Debug, Clone, PartialEq)]
pub struct CrushRule {
    pub mask: CrushRuleMask,
    pub steps: Vec<CrushRuleStep>,
}

/// Algorithm-specific bucket state derived at finalize time
#[derive(Debug, Clone, PartialEq)]
pub enum BucketData {
    /// Uniform bucket - all items share one weight
    Uniform { item_weight: u32 },
    /// List bucket - cumulative weight per position
    List { sum_weights: Vec<u32> },
    /// Tree bucket - implicit in-order binary tree of subtree weights
    Tree { num_nodes: u32, node_weights: Vec<u32> },
    /// Straw bucket - precomputed per-item straw lengths
    Straw { straws: Vec<u32> },
}

/// A CRUSH bucket containing items (devices or other buckets)
#[derive(Debug, Clone, PartialEq)]
pub struct CrushBucket {
    /// Bucket ID (always negative)
    pub id: i32,
    /// Hierarchy level of this bucket (e.g. host, rack, root)
    pub bucket_type: i32,
    /// Selection algorithm
    pub alg: BucketAlgorithm,
    /// Hash function selector (0 = rjenkins1, the only defined value)
    pub hash: u8,
    /// Summed child weight (16.16 fixed-point), cached by finalize
    pub weight: u32,
    /// Number of item slots
    pub size: u32,
    /// Item IDs (negative = buckets, >= 0 = devices)
    pub items: Vec<i32>,
    /// Per-item weights (16.16 fixed-point), parallel to `items`
    pub weights: Vec<u32>,
    /// Algorithm-specific derived state
    pub data: BucketData,
}

/// Main CRUSH map structure
///
/// Buckets live in a sparse array indexed by `-1 - id`; devices are implied
/// by `[0, max_devices)` with a dense offload array. All naming is id-keyed
/// and children reference ids, never each other, so the hierarchy cannot
/// hold cycles. Name tables are ordered maps: the codec walks them in key
/// order to keep encoded output deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct CrushMap {
    /// Device id space is [0, max_devices)
    pub max_devices: i32,
    /// Per-device offload fraction (16.16; 0 = fully available,
    /// 0x10000 = fully offloaded)
    pub device_offload: Vec<u32>,
    /// Buckets array (indexed by -1 - bucket_id; empty slots allowed)
    pub buckets: Vec<Option<CrushBucket>>,
    /// Rules array (indexed by rule id; empty slots allowed)
    pub rules: Vec<Option<CrushRule>>,
    /// Type names (level -> name)
    pub type_names: BTreeMap<i32, String>,
    /// Device and bucket names (id -> name)
    pub names: BTreeMap<i32, String>,
    /// Rule names (rule id -> name)
    pub rule_names: BTreeMap<u32, String>,
}

impl CrushMap {
    /// Create a new empty CRUSH map
    pub fn new() -> Self {
        CrushMap {
            max_devices: 0,
            device_offload: Vec::new(),
            buckets: Vec::new(),
            rules: Vec::new(),
            type_names: BTreeMap::new(),
            names: BTreeMap::new(),
            rule_names: BTreeMap::new(),
        }
    }

    /// Number of bucket slots (dense over the most negative id in use)
    pub fn max_buckets(&self) -> i32 {
        self.buckets.len() as i32
    }

    /// Number of rule slots
    pub fn max_rules(&self) -> u32 {
        self.rules.len() as u32
    }

    /// Get a bucket by ID
    pub fn get_bucket(&self, id: i32) -> crate::error::Result<&CrushBucket> {
        if id >= 0 {
            return Err(crate::error::CrushError::InvalidBucketId(id));
        }
        let index = (-1 - id) as usize;
        self.buckets
            .get(index)
            .and_then(|b| b.as_ref())
            .ok_or(crate::error::CrushError::BucketNotFound(id))
    }

    /// Whether a bucket slot is occupied
    pub fn bucket_exists(&self, id: i32) -> bool {
        self.get_bucket(id).is_ok()
    }

    /// Get a rule by ID
    pub fn get_rule(&self, rule_id: u32) -> crate::error::Result<&CrushRule> {
        self.rules
            .get(rule_id as usize)
            .and_then(|r| r.as_ref())
            .ok_or(crate::error::CrushError::RuleNotFound(rule_id))
    }

    /// Whether a rule slot is occupied
    pub fn rule_exists(&self, rule_id: u32) -> bool {
        self.get_rule(rule_id).is_ok()
    }

    /// Name of a hierarchy level, if registered
    pub fn type_name(&self, level: i32) -> Option<&str> {
        self.type_names.get(&level).map(|s| s.as_str())
    }

    /// Name of a device or bucket, if registered
    pub fn item_name(&self, id: i32) -> Option<&str> {
        self.names.get(&id).map(|s| s.as_str())
    }

    /// Name of a rule, if registered
    pub fn rule_name(&self, rule_id: u32) -> Option<&str> {
        self.rule_names.get(&rule_id).map(|s| s.as_str())
    }

    /// Offload fraction for a device (0 for devices never marked)
    pub fn get_device_offload(&self, id: i32) -> u32 {
        if id < 0 {
            return 0;
        }
        self.device_offload.get(id as usize).copied().unwrap_or(0)
    }

    /// Hierarchy level of an item: 0 for devices, the bucket's own type
    /// otherwise
    pub fn item_level(&self, id: i32) -> crate::error::Result<i32> {
        if id >= 0 {
            Ok(0)
        } else {
            Ok(self.get_bucket(id)?.bucket_type)
        }
    }
}

impl Default for CrushMap {
    fn default() -> Self {
        Self::new()
    }
}
