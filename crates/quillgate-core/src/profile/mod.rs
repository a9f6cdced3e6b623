//! Quality profile configuration.
//!
//! A profile is the configuration resource of the pipeline: expected
//! sections, structured block schemas, weighted criteria, decision band
//! thresholds and retry budgets. It is read once at startup; any error here
//! is fatal to the process, never to an individual run.

mod criteria;
mod parser;
mod schema;

pub use criteria::{Criterion, CriterionKind, RuleCheck};
pub use parser::{
    BlockSchemaSpec, Limits, ProfileError, QualityProfile, SectionPrecedence, SectionSpec,
    Thresholds,
};
pub use schema::validate_profile_schema;

#[cfg(test)]
pub(crate) use parser::tests::VALID_PROFILE;
