//! Server side: routing, interceptors and the connection runtime.

pub mod interceptor;
pub mod router;
mod runtime;

pub use interceptor::{CallContext, Interceptor, InterceptorChain, LoggingInterceptor, Next};
pub use router::{
    MethodDescriptor, MethodHandler, ResponseSink, Router, StreamingHandler, UnaryHandler,
    REFLECTION_METHOD,
};
pub use runtime::Server;
