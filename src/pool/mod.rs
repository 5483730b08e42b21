//! Connection pooling.
//!
//! A [`PoolRegistry`] maps each [`PoolKey`] to a [`ConnPool`]; each pool
//! runs one worker task per connection. Connections enter a pool only after
//! they have served their first request and leave it when they close.

pub(crate) mod conn_pool;
pub(crate) mod key;
pub(crate) mod registry;

pub(crate) use conn_pool::{ConnPool, Outcome, Task};
pub(crate) use key::PoolKey;
pub(crate) use registry::PoolRegistry;
