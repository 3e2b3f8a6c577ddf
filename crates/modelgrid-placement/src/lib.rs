//! modelgrid-placement — node eligibility for artifact placement.
//!
//! Placement is a filter, not an optimizer: every eligible node receives the
//! artifact. This crate decides eligibility from node roles, the cost-tier
//! attribute of data nodes, and the exclusion list. It reads a policy
//! snapshot per call and caches nothing, so policy changes apply to the
//! next request.
//!
//! # Components
//!
//! - **`resolver`** — `EligibilityResolver` (`resolve`, `filter_eligible`, `is_eligible`)

pub mod resolver;

pub use resolver::EligibilityResolver;
