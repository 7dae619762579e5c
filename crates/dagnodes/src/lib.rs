//! Standard operator library
//!
//! Collection of built-in operators for common operations

mod debug;
mod param;
mod time;

pub use debug::DebugOperator;
pub use param::{EmitOperator, SetParamsOperator};
pub use time::DelayOperator;
use dagruntime::OperatorRegistry;

use std::sync::Arc;

/// Register all standard operators with a registry
pub fn register_all(registry: &OperatorRegistry) {
    registry.register("debug.log", Arc::new(debug::DebugOperatorFactory));
    registry.register("time.delay", Arc::new(time::DelayOperatorFactory));
    registry.register("param.set", Arc::new(param::SetParamsOperatorFactory));
    registry.register("value.emit", Arc::new(param::EmitOperatorFactory));
}
