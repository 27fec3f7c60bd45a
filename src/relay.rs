//! One request/response exchange between an accepted client and the target.

use crate::config::TunnelConfig;
use crate::error::{ProxyError, Result};
use crate::message::{HttpRequest, HttpResponse};
use crate::net;
use crate::tunnel::RelayHooks;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;

/// Steps of a relay, in order. Each names the step being carried out, so a
/// failure reports the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Accepted,
    RequestRead,
    UpstreamConnected,
    RequestForwarded,
    ResponseRead,
    ResponseFixed,
    ResponseSent,
    Closed,
}

pub struct RelayConnection {
    client: TcpStream,
    config: Arc<TunnelConfig>,
    hooks: Arc<dyn RelayHooks>,
}

impl RelayConnection {
    pub fn new(client: TcpStream, config: Arc<TunnelConfig>, hooks: Arc<dyn RelayHooks>) -> Self {
        Self { client, config, hooks }
    }

    /// Relays a single exchange, then closes the client socket.
    ///
    /// Errors are logged here; the returned value is only informational.
    pub fn run(self) -> Result<()> {
        let Self { client, config, hooks } = self;
        let peer = client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let result = exchange(&client, &config, hooks.as_ref());
        net::close_quietly(client);

        match &result {
            Ok(()) => log::debug!("Relay for {} closed", peer),
            Err(e) => log::warn!("Relay for {} aborted: {}", peer, e),
        }
        result
    }
}

fn failed<E: Into<ProxyError>>(state: RelayState) -> impl FnOnce(E) -> ProxyError {
    move |e| ProxyError::Relay {
        state,
        source: Box::new(e.into()),
    }
}

fn exchange(client: &TcpStream, config: &TunnelConfig, hooks: &dyn RelayHooks) -> Result<()> {
    let mut request = HttpRequest::read_from(&mut BufReader::new(client)).map_err(failed(RelayState::RequestRead))?;
    log::debug!("Relaying {} {}", request.method(), request.path());

    let upstream = net::connect(&config.target_host, config.target_port, None)
        .map_err(failed(RelayState::UpstreamConnected))?;

    request.set_host(config.target_host.as_str());
    request.set_port(config.target_port);
    request.regenerate_host_header();
    hooks.on_request(&mut request);

    if let Err(e) = request.send_to(&mut &upstream) {
        net::close_quietly(upstream);
        return Err(failed(RelayState::RequestForwarded)(e));
    }

    let response = HttpResponse::read_for_request(&mut BufReader::new(&upstream), request.method());
    // the upstream is done with as soon as its response is read
    net::close_quietly(upstream);
    let mut response = response.map_err(failed(RelayState::ResponseRead))?;

    if let Some(len) = response.body_raw().map(|body| body.len() as u64) {
        response.header_remove("transfer-encoding");
        response.set_content_length(len);
    }

    hooks.on_response(&mut response);

    let mut out = client;
    response.send_to(&mut out).map_err(failed(RelayState::ResponseSent))?;
    log::debug!("Relayed response {} to client", response.status());
    Ok(())
}
