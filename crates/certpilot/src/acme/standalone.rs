//! Minimal HTTP listener answering HTTP-01 challenges while the proxy is down.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use http::header::{HeaderValue, CONTENT_TYPE};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::challenge::ChallengeManager;

/// Deadline for a client to send its request head
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A running standalone challenge listener
#[derive(Debug)]
pub struct StandaloneServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StandaloneServer {
    /// Bind `addr` and start answering from `challenges`
    pub async fn bind(addr: SocketAddr, challenges: ChallengeManager) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(address = %local_addr, "Standalone challenge listener started");

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            trace!(peer = %peer, "Accepted challenge connection");
                            let challenges = challenges.clone();
                            let token = token.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, challenges, token).await {
                                    debug!(peer = %peer, error = %e, "Challenge connection failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept challenge connection"),
                    },
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and release the port
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Standalone listener task ended abnormally");
            }
        }
        info!(address = %self.local_addr, "Standalone challenge listener stopped");
    }
}

impl Drop for StandaloneServer {
    // An abandoned attempt must not keep the port bound
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve one connection, draining it once `shutdown` fires
async fn serve_connection(
    stream: TcpStream,
    challenges: ChallengeManager,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let service = service_fn(move |request: Request<Incoming>| {
        let response = answer(&request, &challenges);
        async move { Ok::<_, Infallible>(response) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => return result,
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

fn answer(request: &Request<Incoming>, challenges: &ChallengeManager) -> Response<String> {
    let method = request.method();
    if method != Method::GET && method != Method::HEAD {
        return respond(StatusCode::METHOD_NOT_ALLOWED, String::new());
    }

    let Some(token) = ChallengeManager::extract_token(request.uri().path()) else {
        return respond(StatusCode::NOT_FOUND, String::new());
    };

    match challenges.get_response(token) {
        Some(key_authorization) => {
            debug!(token = %token, "Answered standalone challenge");
            respond(StatusCode::OK, key_authorization)
        }
        None => {
            debug!(token = %token, "Unknown challenge token requested");
            respond(StatusCode::NOT_FOUND, String::new())
        }
    }
}

fn respond(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
