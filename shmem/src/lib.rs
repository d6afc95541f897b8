pub mod capacity;
pub mod channels;
pub mod core;
mod errors;
pub mod groups;
pub mod layer;
pub mod names;

#[cfg(test)]
mod tests;

pub use crate::capacity::{CapacityRule, PatternKind};
pub use crate::channels::Message;
pub use crate::errors::{IpcError, Result};
pub use crate::layer::{ChannelLayer, LayerConfig, LayerConfigBuilder};
