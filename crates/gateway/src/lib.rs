#![forbid(unsafe_code)]

pub mod auth;
pub mod compiler;
pub mod config;
pub mod date_parser;
mod error;
pub mod gateway;
pub mod http;
pub mod query;
pub mod subscription;
pub mod transform;
pub mod ws;

pub use auth::Authenticator;
pub use compiler::{CompiledQuery, CubeMeta, MemberMeta, MetaSource, QueryCompiler, SchemaCompiler};
pub use config::GatewayConfig;
pub use error::{ApiError, CONTINUE_WAIT};
pub use gateway::{ApiGateway, RequestContext, SubscriptionHooks};
pub use http::{AppState, router};
pub use query::{EMPTY_QUERY_MESSAGE, NormalizedQuery, Query, normalize_query, validate_query};
pub use subscription::{
    AuthContext, InboundFrames, LocalSubscriptionStore, MessageSink, SubscriptionServer,
    SubscriptionStore,
};
pub use ws::WsHub;
