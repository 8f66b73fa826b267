//! Reconciliation back-ends
//!
//! One task model, two renderers: [`Target::Direct`] executes against the
//! cloud API through the [`Cloud`](crate::cloud::Cloud) handle, and
//! [`Target::Emitter`] produces a declarative infrastructure description
//! instead of touching the cloud.

mod emitter;

pub use emitter::EmitterTarget;

/// The back-end a reconciliation run renders through
pub enum Target {
    /// Execute create/update calls against the cloud API
    Direct,
    /// Write a declarative infrastructure description
    Emitter(EmitterTarget),
}

impl Target {
    /// Short back-end name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Emitter(_) => "emitter",
        }
    }
}
