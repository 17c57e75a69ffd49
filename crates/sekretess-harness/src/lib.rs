//! Test harness for Sekretess businesses.
//!
//! In-process doubles for everything outside the core, so the dispatch
//! protocol can be exercised end to end without a network:
//!
//! - [`ScriptedChannel`]: A [`ServerChannel`](sekretess_core::ServerChannel)
//!   that records every call and can be scripted to report identity changes,
//!   subscriptions, pending key distributions and failures
//! - [`ConsumerDevice`]: A consumer that publishes key bundles and decrypts
//!   direct messages and broadcasts
//! - [`TestEnv`]: Seeded randomness and a settable clock

#![forbid(unsafe_code)]

pub mod consumer;
pub mod scripted_channel;
pub mod test_env;

pub use consumer::{ConsumerDevice, ConsumerError, Received};
pub use scripted_channel::{Endpoint, ScriptedChannel, SentAd, SentMessage};
use sekretess_core::{
    Dispatcher, InitError, Persistence, RatchetEngine, StoreBridge, StoreInitializer,
};
pub use test_env::TestEnv;

/// Dispatcher type used throughout the harness tests.
pub type TestDispatcher = Dispatcher<RatchetEngine<TestEnv>, ScriptedChannel>;

/// Initialize the business `name` (device 1) over `persistence`.
pub fn initialize(
    name: &str,
    persistence: Persistence,
    env: &TestEnv,
) -> Result<StoreBridge<RatchetEngine<TestEnv>>, InitError> {
    StoreInitializer::new(RatchetEngine::new(env.clone()), persistence, env.clone())
        .initialize(name, 1)
}

/// Initialize the business `name` and wrap it in a dispatcher over `channel`.
pub fn start_business(
    name: &str,
    persistence: Persistence,
    env: &TestEnv,
    channel: ScriptedChannel,
) -> Result<TestDispatcher, InitError> {
    Ok(Dispatcher::new(initialize(name, persistence, env)?, channel))
}
