pub mod config;
pub mod error;
pub mod layers;
pub mod params;
pub mod preprocess;
pub mod encoder;
pub mod routing;
pub mod capsule;
pub mod decoder;
pub mod probe;
pub mod sparsity;
pub mod loss;
pub mod report;
pub mod builder;
pub mod core;

// Réexportations principales
pub use builder::AutoencoderBuilder;
pub use capsule::{RoutingOutput, VoteRoutingLayer};
pub use config::{AutoencoderConfig, DecodeSource, ObjectiveWeights, SparsityLossType, TargetPrep};
pub use core::{AutoencoderOutput, ImageAutoencoder};
pub use error::{Result, ScaeError};
pub use loss::{LossTerms, ObjectiveAssembler};
pub use report::Report;
pub use sparsity::SparsityRegularizer;
