// src/listener/mod.rs
//! Connection-acceptance subsystem: address resolution, socket setup,
//! listener bookkeeping, and accept dispatch.

mod dispatcher;
mod factory;
mod registry;
mod resolver;
mod sockaddr;

pub use dispatcher::AcceptDispatcher;
pub use factory::{create_and_bind, SocketError};
pub use registry::{close_connection, BoundAddr, ListenSocket, ListenerRegistry, ReadinessTargets};
pub use resolver::{resolve, BindTarget, ResolveError, SocketFamily};
