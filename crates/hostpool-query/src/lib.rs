pub mod compile;
pub mod error;
pub mod params;
pub mod registry;
pub mod sanitize;

pub use compile::{flatten, parse_json_query, parse_query, parse_request_args, render};
pub use error::QueryError;
pub use params::{
    ModuleKind, OpKind, ParamDefault, ParamDescriptor, ParamSource, ParameterMap,
};
pub use registry::ParameterRegistry;
pub use sanitize::sanitize;
