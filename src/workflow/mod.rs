pub mod dispatch_ctx;
pub mod dispatch_flow;

pub use dispatch_ctx::DispatchCtx;
pub use dispatch_flow::DispatchFlow;
