pub mod graph_store;

pub use graph_store::{CreatedProject, GraphStore, ProjectTransition, RedbGraphStore, StepTransition};
