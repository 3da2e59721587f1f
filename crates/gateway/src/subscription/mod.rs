#![forbid(unsafe_code)]

mod server;
mod store;

pub use server::{InboundFrames, MessageSink, SubscriptionServer};
pub use store::{
    AuthContext, LiveSubscription, LocalSubscriptionStore, Subscription, SubscriptionStore,
};
