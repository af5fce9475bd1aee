pub mod model;
pub mod train_data;
