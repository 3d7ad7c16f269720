//! User functions: loading, binding and invocation.

pub mod adapter;
pub mod callback;
pub mod dylib;
pub mod handler;
pub mod loader;
pub mod session;
pub mod specialization;

pub use adapter::{invoke, InvocationError};
pub use callback::{Callback, Delivery, DeliverySource};
pub use dylib::{DylibResolver, WireOwned, WireSlice};
pub use handler::{
    FunctionContext, FunctionError, FunctionResult, Handler, Protocol, Returned,
};
pub use loader::{FunctionLoader, LoadError, Module, ModuleResolver, ModuleTable};
pub use session::{Session, SessionMessage};
pub use specialization::{
    BoundFunction, SpecializationState, SpecializeError, SpecializeRequest, Specializer,
};
