//! Domain types shared by the pipeline stages, the job lifecycle and the API.

pub mod documents;
pub mod estimate;
pub mod extraction;
pub mod jobs;
pub mod measurement;

// Re-export commonly used types
pub use documents::*;
pub use estimate::*;
pub use extraction::*;
pub use jobs::*;
pub use measurement::*;
