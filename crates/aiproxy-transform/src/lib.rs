pub mod cache_control;
pub mod generate_content;
pub mod ids;
pub mod registry;
pub mod schema;
pub mod signature;

pub use registry::{Format, Registry, StreamContext, TranslateContext, TranslateError};
pub use signature::SignatureCache;
