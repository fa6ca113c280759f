//! Syntax tree for the CRUSH map DSL.
//!
//! Each top-level construct keeps the byte span of its source text so
//! diagnostics can point back into the input.

use logos::Span;

/// A parsed source file: top-level constructs in source order
#[derive(Debug, Clone)]
pub struct Program {
    pub decls: Vec<Decl>,
}

#[derive(Debug, Clone)]
pub enum Decl {
    Device(DeviceDecl),
    BucketType(TypeDecl),
    Bucket(BucketDecl),
    Rule(RuleDecl),
}

/// `device <id> <name> [offload <f> | load <f> | down]`
#[derive(Debug, Clone)]
pub struct DeviceDecl {
    pub id: i64,
    pub name: String,
    pub offload: Option<OffloadSpec>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffloadSpec {
    Offload(f64),
    Load(f64),
    Down,
}

/// `type <level> <name>`
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub level: i64,
    pub name: String,
    pub span: Span,
}

/// `<type-name> <bucket-name> { [id <n>] [alg <name>] item* }`
#[derive(Debug, Clone)]
pub struct BucketDecl {
    pub type_name: String,
    pub name: String,
    /// Explicit id; `id 0` means unassigned, like an absent clause
    pub id: Option<i64>,
    pub alg: Option<String>,
    pub items: Vec<ItemClause>,
    pub span: Span,
}

/// `item <name> [weight <f>] [pos <n>]`
#[derive(Debug, Clone)]
pub struct ItemClause {
    pub name: String,
    pub weight: Option<f64>,
    pub pos: Option<i64>,
    pub span: Span,
}

/// `rule [<name>] { pool .. type .. min_size .. max_size .. step* }`
#[derive(Debug, Clone)]
pub struct RuleDecl {
    pub name: Option<String>,
    pub pool: i64,
    pub rule_type: String,
    pub min_size: i64,
    pub max_size: i64,
    pub steps: Vec<StepDecl>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct StepDecl {
    pub kind: StepKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Take { item: String },
    Choose {
        /// chooseleaf rather than choose
        leaf: bool,
        /// firstn rather than indep
        firstn: bool,
        n: i64,
        type_name: String,
    },
    Emit,
}
