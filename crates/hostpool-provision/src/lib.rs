pub mod error;
pub mod lab;
pub mod lab_xml;
pub mod local;
pub mod provisioner;
pub mod registry;

pub use error::ProvisionError;
pub use lab::{LabConfig, LabProvisioner};
pub use local::LocalProvisioner;
pub use provisioner::Provisioner;
pub use registry::ProvisionerRegistry;
