//! Container lister collaborator interface and its concrete Docker client.

mod lister;

pub use lister::{BollardContainerLister, Container, ContainerFilter, ContainerLister};
#[cfg(test)]
pub use lister::FakeLister;
