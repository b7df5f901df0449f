pub mod registry;

pub use registry::{ClusterHandle, ClusterRegistry, ProbeState};
