pub mod builder;

pub use builder::{BuildRequest, BuildResult, ImageBuilder, ImageError};
