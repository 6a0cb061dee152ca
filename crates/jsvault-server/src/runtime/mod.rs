pub mod bindings;
pub mod conversions;
pub mod exchange;
pub mod limits;
pub mod module_cache;
pub mod module_runtime;
pub mod runtime_pool;

mod loader;


pub use bindings::GlobalContext;
pub use exchange::{HttpExchange, ScriptResponse, ServiceOutcome};
pub use limits::EngineLimits;
pub use module_cache::{ModuleCache, ResolvedModule};
pub use module_runtime::{ModuleHandle, ModuleRuntime, RuntimeOptions};
pub use runtime_pool::{PooledRuntime, RuntimePool};
