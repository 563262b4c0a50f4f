//! Bounded queue primitives: the entry buffer, the completion-ordered fetch
//! stage, and the sequential process stage.

pub(crate) mod buffer;
pub(crate) mod ordered;
pub(crate) mod process;
