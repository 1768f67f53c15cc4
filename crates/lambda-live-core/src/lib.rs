// Developer-machine side of lambda-live: bus, relay, runtime API and workers

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod relay;
pub mod runtime;
pub mod utils;
pub mod watcher;
pub mod workers;

pub use bus::{EventBus, EventSubscription, SubscriptionHandle};
pub use config::Config;
pub use context::{AppContext, SessionOptions, Transport};
pub use error::{Error, Result};
