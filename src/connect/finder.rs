//! Finding a connection for an exchange: pooled, coalesced, or freshly
//! dialed.

use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::client::events::EventListener;
use crate::client::Call;
use crate::error::Result;

use super::conn::Connection;
use super::pool::ConnectionPool;
use super::route::{RouteDatabase, RouteSelection, RouteSelector};
use super::{Address, Route};

/// Per-call connection planning state. It persists across retries so a
/// follow-up attempt continues from the next untried route rather than
/// starting over.
pub(crate) struct ExchangeFinder {
    pool: ConnectionPool,
    address: Arc<Address>,
    route_database: Arc<RouteDatabase>,
    call: Call,
    events: Arc<dyn EventListener>,
    route_selector: Option<RouteSelector>,
    route_selection: Option<RouteSelection>,
    /// A route worth revisiting first, e.g. after a coalesced connection
    /// turned out not to cover the host.
    next_route_to_try: Option<Route>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        pool: ConnectionPool,
        address: Arc<Address>,
        route_database: Arc<RouteDatabase>,
        call: Call,
        events: Arc<dyn EventListener>,
    ) -> ExchangeFinder {
        ExchangeFinder {
            pool,
            address,
            route_database,
            call,
            events,
            route_selector: None,
            route_selection: None,
            next_route_to_try: None,
        }
    }

    pub(crate) fn address(&self) -> &Arc<Address> {
        &self.address
    }

    /// Finds a healthy connection and registers the call on it.
    pub(crate) fn find(
        &mut self,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        loop {
            let connection =
                self.find_connection(connect_timeout, read_timeout, write_timeout)?;
            if connection.is_healthy(true) {
                return Ok(connection);
            }
            // A pooled connection died while idle. Poison it, release our
            // claim, and plan again.
            trace!("connection {} unhealthy, discarding", connection.id());
            connection.no_new_exchanges();
            connection.release_allocation(&self.call);
        }
    }

    fn find_connection(
        &mut self,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        self.call.inner.check_canceled()?;

        // First: any pooled connection for this address.
        if let Some(connection) = self.pool.acquire(&self.address, &self.call, None, false) {
            self.events.connection_acquired(&self.call, &connection);
            return Ok(connection);
        }

        // Next: a route to dial.
        let route = match self.next_route_to_try.take() {
            Some(route) => route,
            None => {
                let next_from_selection = self
                    .route_selection
                    .as_mut()
                    .and_then(|selection| selection.next());
                match next_from_selection {
                    Some(route) => route,
                    None => {
                        if self.route_selector.is_none() {
                            self.route_selector = Some(RouteSelector::new(
                                self.address.clone(),
                                self.route_database.clone(),
                                self.call.clone(),
                                self.events.clone(),
                            ));
                        }
                        let selection = self.route_selector.as_mut().unwrap().next()?;

                        // A fresh batch of routes may unlock an HTTP/2
                        // connection to another host via coalescing.
                        if let Some(connection) = self.pool.acquire(
                            &self.address,
                            &self.call,
                            Some(selection.routes()),
                            false,
                        ) {
                            self.route_selection = Some(selection);
                            self.events.connection_acquired(&self.call, &connection);
                            return Ok(connection);
                        }

                        self.route_selection = Some(selection);
                        self.route_selection.as_mut().unwrap().next().expect(
                            "a route selection is never empty",
                        )
                    }
                }
            }
        };

        let connection = match Connection::connect(
            route.clone(),
            connect_timeout,
            read_timeout,
            write_timeout,
            &self.call,
            &self.events,
        ) {
            Ok(connection) => connection,
            Err(e) => {
                self.route_database.failed(&route);
                return Err(e);
            }
        };
        self.route_database.connected(&route);

        // A racing call may have built an equivalent multiplexed
        // connection; prefer the pooled one and discard ours.
        if let Some(existing) = self.pool.acquire(
            &self.address,
            &self.call,
            Some(std::slice::from_ref(&route)),
            true,
        ) {
            trace!("discarding connection {} for pooled duplicate", connection.id());
            connection.close();
            self.next_route_to_try = Some(route);
            self.events.connection_acquired(&self.call, &existing);
            return Ok(existing);
        }

        connection.register_call(&self.call);
        self.pool.put(connection.clone());
        self.events.connection_acquired(&self.call, &connection);
        Ok(connection)
    }

    /// Plans the next attempt on `route` again, after a failure that
    /// condemns the connection but not the route, e.g. a refused stream.
    pub(crate) fn retry_on(&mut self, route: Route) {
        self.next_route_to_try = Some(route);
    }

    /// Whether route planning has another candidate, consulted by the
    /// retry policy.
    pub(crate) fn retry_after_failure(&self) -> bool {
        if self.next_route_to_try.is_some() {
            return true;
        }
        if let Some(ref selection) = self.route_selection {
            if selection.has_next() {
                return true;
            }
        }
        match self.route_selector {
            Some(ref selector) => selector.has_next(),
            // Planning has not started; there is everything left to try.
            None => true,
        }
    }
}

impl std::fmt::Debug for ExchangeFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeFinder")
            .field("address", &self.address)
            .finish()
    }
}
