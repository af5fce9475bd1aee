pub mod data_loader;
pub mod record;

pub use data_loader::SyntheticLoader;
pub use record::{DataRecord, Field};
