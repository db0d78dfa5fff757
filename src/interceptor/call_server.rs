//! The last interceptor in the chain: writes the request to the server
//! and reads its response.

use std::thread;

use log::debug;

use crate::error::{Error, Result};
use crate::headers;
use crate::http_date::now_epoch_millis;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

pub(crate) struct CallServer;

impl Interceptor for CallServer {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let exchange = chain
            .exchange()
            .expect("an exchange precedes the call server")
            .clone();
        let request = chain.request().clone();
        let sent_request_at = now_epoch_millis();

        exchange.write_request_headers(&request)?;

        let mut early_builder = None;
        if request.method().permits_request_body() && request.body().is_some() {
            let body = request.body().expect("checked above").clone();

            // An Expect: 100-continue request holds the body back until the
            // server commits to reading it.
            if expects_continue(&request) {
                exchange.flush_request()?;
                early_builder = exchange.read_response_headers(true)?;
            }

            match early_builder {
                None => {
                    if body.is_duplex() {
                        // The response may start while the body is still
                        // streaming, so the body gets its own thread.
                        exchange.flush_request()?;
                        let mut sink = exchange.create_request_body(&request, true)?;
                        let writer_exchange = exchange.clone();
                        thread::Builder::new()
                            .name("courier DuplexRequestBody".to_owned())
                            .spawn(move || {
                                if body.write_to(&mut sink).is_ok() && sink.close().is_ok() {
                                    let _ = writer_exchange.finish_request();
                                }
                            })
                            .map_err(|e| {
                                Error::new_io(std::io::Error::new(std::io::ErrorKind::Other, e))
                            })?;
                    } else {
                        let mut sink = exchange.create_request_body(&request, false)?;
                        body.write_to(&mut sink)
                            .map_err(|e| exchange.fail(Error::new_io(e).with_request_sent()))?;
                        sink.close()?;
                        exchange.finish_request()?;
                    }
                }
                Some(_) => {
                    // The server answered without taking the body.
                    debug!("server replied before 100-continue body");
                    exchange.no_request_body();
                    if !exchange.connection().is_multiplexed() {
                        // The unsent body would desynchronize the framing.
                        exchange.connection().no_new_exchanges();
                    }
                }
            }
        } else {
            exchange.no_request_body();
            exchange.finish_request()?;
        }

        let mut builder = match early_builder {
            Some(builder) => builder,
            None => exchange
                .read_response_headers(false)?
                .expect("a final response"),
        };
        // Skip interim responses other than 101, which is final when no
        // upgrade was requested.
        while matches!(builder.peek_code(), Some(code) if (100..200).contains(&code) && code != 101)
        {
            builder = exchange
                .read_response_headers(false)?
                .expect("a final response");
        }

        let response = builder
            .request(request.clone())
            .handshake(exchange.connection().handshake().cloned())
            .sent_request_at_millis(sent_request_at)
            .received_response_at_millis(now_epoch_millis())
            .build();
        exchange.response_headers_end(&response);
        let code = response.code();

        let body = exchange.open_response_body(&response)?;
        let response = response.new_builder().body(body).build();

        if headers::has_connection_token(request.headers(), "close")
            || headers::has_connection_token(response.headers(), "close")
        {
            exchange.connection().no_new_exchanges();
        }

        if code == 204 || code == 205 {
            if let Some(length) = headers::content_length(response.headers()) {
                if length > 0 {
                    return Err(exchange.fail(Error::new_protocol(format!(
                        "HTTP {} had non-zero Content-Length: {}",
                        code, length
                    ))));
                }
            }
        }

        Ok(response)
    }
}

fn expects_continue(request: &crate::request::Request) -> bool {
    request
        .header("Expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}
