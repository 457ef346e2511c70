//! Converge Diff - Normalization and diffing of Kubernetes resources
//!
//! Decides whether a live object has drifted from its desired manifest
//! without reporting server-side defaults as drift:
//! - `diff`: strategy selection (structured merge, three-way, two-way)
//! - `normalize`: pre-diff canonicalization and the pluggable [`Normalizer`]
//! - `strategic`: strategic and JSON three-way merge patches
//! - `structured`: managed-fields aware apply used for server-side diffs
//! - `hide`: secret value redaction that preserves equality classes
//! - `render`: line-based rendering of a diff result

pub mod defaults;
pub mod diff;
pub mod error;
pub mod hide;
pub mod json;
pub mod normalize;
pub mod render;
pub mod schema;
pub mod strategic;
pub mod structured;

pub use diff::{
    DEFAULT_MANAGER, DiffOptions, DiffResult, DiffResultList, ServerSideDryRunner, diff,
    diff_array, diff_with_runner, last_applied_config, server_side_diff, structured_merge_diff,
    three_way_diff, two_way_diff,
};
pub use error::{DiffError, Result};
pub use hide::hide_secret_data;
pub use normalize::{NoopNormalizer, Normalizer, normalize, normalize_secret};
pub use render::{DiffContent, DiffLine, LineType};
pub use schema::{KindSchema, ListStrategy, SchemaRegistry};
