//! Route planning: expanding an address into dial targets, one at a time.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::client::events::EventListener;
use crate::client::Call;
use crate::error::{Error, Result};

use super::{Address, Proxy, Route};

/// The routes that failed recently. They are deprioritised, not
/// forbidden: when every other route has failed too, the failed ones are
/// tried again last.
#[derive(Debug, Default)]
pub(crate) struct RouteDatabase {
    failed_routes: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub(crate) fn failed(&self, route: &Route) {
        self.failed_routes.lock().unwrap().insert(route.clone());
    }

    pub(crate) fn connected(&self, route: &Route) {
        self.failed_routes.lock().unwrap().remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed_routes.lock().unwrap().contains(route)
    }
}

/// Lazily yields the routes for an address: for each proxy in order, the
/// resolved socket addresses of either the proxy or the origin.
pub(crate) struct RouteSelector {
    address: Arc<Address>,
    route_database: Arc<RouteDatabase>,
    call: Call,
    events: Arc<dyn EventListener>,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    /// Routes that failed recently, deferred to the very end.
    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    pub(crate) fn new(
        address: Arc<Address>,
        route_database: Arc<RouteDatabase>,
        call: Call,
        events: Arc<dyn EventListener>,
    ) -> RouteSelector {
        events.proxy_select_start(&call, address.url());
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let selected = address.proxy_selector().select(address.url());
                if selected.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    selected
                }
            }
        };
        events.proxy_select_end(&call, address.url(), &proxies);

        RouteSelector {
            address,
            route_database,
            call,
            events,
            proxies,
            next_proxy_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxies.len() || !self.postponed_routes.is_empty()
    }

    /// The next batch of routes to attempt.
    pub(crate) fn next(&mut self) -> Result<RouteSelection> {
        let mut routes = Vec::new();
        while routes.is_empty() {
            if self.next_proxy_index < self.proxies.len() {
                let proxy = self.proxies[self.next_proxy_index].clone();
                self.next_proxy_index += 1;

                for socket_address in self.resolve(&proxy)? {
                    let route =
                        Route::new(self.address.clone(), proxy.clone(), socket_address);
                    if self.route_database.should_postpone(&route) {
                        self.postponed_routes.push(route);
                    } else {
                        routes.push(route);
                    }
                }
            } else if !self.postponed_routes.is_empty() {
                // Every non-failed route is exhausted; revisit the failed
                // ones.
                trace!("retrying {} postponed routes", self.postponed_routes.len());
                routes.append(&mut self.postponed_routes);
            } else {
                return Err(Error::new_connect(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "exhausted all routes",
                )));
            }
        }
        Ok(RouteSelection { routes, index: 0 })
    }

    /// Resolves the socket addresses for one proxy choice. A proxied
    /// route resolves the proxy's host; the target's DNS happens on the
    /// far side. Direct routes resolve the target.
    fn resolve(&self, proxy: &Proxy) -> Result<Vec<SocketAddr>> {
        let (socket_host, socket_port) = match proxy {
            Proxy::Direct => (self.address.host(), self.address.port()),
            Proxy::Http { host, port } | Proxy::Socks { host, port } => (host.as_str(), *port),
        };

        self.events.dns_start(&self.call, socket_host);
        let addresses = self
            .address
            .dns()
            .lookup(socket_host)
            .map_err(|e| Error::new_unknown_host(e))?;
        if addresses.is_empty() {
            return Err(Error::new_unknown_host(format!(
                "{:?} returned no addresses for {}",
                self.address.dns(),
                socket_host
            )));
        }
        self.events.dns_end(&self.call, socket_host, &addresses);

        Ok(addresses
            .into_iter()
            .map(|ip| SocketAddr::new(ip, socket_port))
            .collect())
    }
}

impl std::fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelector")
            .field("proxies", &self.proxies)
            .field("next_proxy_index", &self.next_proxy_index)
            .field("postponed", &self.postponed_routes.len())
            .finish()
    }
}

/// One batch of routes sharing a proxy.
#[derive(Debug)]
pub(crate) struct RouteSelection {
    routes: Vec<Route>,
    index: usize,
}

impl RouteSelection {
    pub(crate) fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    pub(crate) fn next(&mut self) -> Option<Route> {
        if self.index < self.routes.len() {
            let route = self.routes[self.index].clone();
            self.index += 1;
            Some(route)
        } else {
            None
        }
    }

    /// The full batch, used for connection coalescing lookups.
    pub(crate) fn routes(&self) -> &[Route] {
        &self.routes
    }
}
