pub mod joiner;
pub mod reconciler;

pub use joiner::{Projection, ProjectionEntry, project};
pub use reconciler::Reconciler;
