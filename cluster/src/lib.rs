//! `ClusterDriver` and the Cluster Renderer (C3): the container-orchestrator
//! boundary. The production implementation talks to a real cluster through
//! `kube`; `testdoubles::InMemoryClusterDriver` stands in for it in tests.

pub mod driver;
pub mod kube_driver;
pub mod render;
pub mod testdoubles;

pub use driver::{
    BuildEvent, BuildImagesResult, BuildJobSpec, BuildResourceSpec, ClusterDriver, ClusterError,
    LogKind,
};
pub use kube_driver::KubeClusterDriver;
pub use render::{render, RenderContext, RenderedEnvironment};
