//! Shared domain types for stepwright.
//!
//! The [`CorrectionSet`] document is what a live editing session produces:
//! an ordered list of form [`Step`]s, each carrying the [`Field`]s that the
//! automation will later fill. The status enums describe where an editable
//! subject sits in its lifecycle and are shared by the server and any client
//! that talks to it.

pub mod correction;
pub mod status;

pub use correction::{CorrectionSet, Field, FormType, Step};
pub use status::{EditingStatus, LoginPhase, SubjectKind, SubjectStatus};
