//! Type registry and unit store for one project, layered over the shared
//! doctrine base.

pub mod doctrine;
pub mod project;
pub mod registry;
pub mod units;

pub use doctrine::{DoctrineBase, DoctrineView};
pub use project::ProjectState;
pub use registry::TypeRegistry;
pub use units::UnitStore;
