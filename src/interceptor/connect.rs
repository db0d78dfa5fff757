//! Binds the call to a live connection, opening the network tier of the
//! chain.

use crate::error::Result;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// Finds a connection for the target address, allocates an exchange on
/// it, and proceeds. Everything after this interceptor may do network
/// I/O; everything before it sees only the request and response values.
pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();
        let exchange = chain.call().inner.initialize_exchange(
            chain.connect_timeout(),
            chain.read_timeout(),
            chain.write_timeout(),
        )?;
        chain.exchange = Some(exchange);

        match chain.proceed(request) {
            Ok(response) => Ok(response),
            Err(e) => {
                // The exchange may never have reached the release path,
                // e.g. when a network interceptor failed without touching
                // the wire.
                if let Some(exchange) = chain.exchange() {
                    exchange.detach();
                }
                Err(e)
            }
        }
    }
}
