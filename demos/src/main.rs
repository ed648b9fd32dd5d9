use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info, warn};
use tokio::sync::broadcast;

use rtc_data_endpoint::endpoint::{Endpoint, EndpointConfig, EndpointEvent, Transports};
use rtc_data_endpoint::error::Error;
use rtc_data_endpoint::signal::{CandidateBody, OfferBody, Signalling};
use rtc_data_endpoint::transport::SystemDiscovery;

mod stub;

#[derive(Parser)]
#[command(name = "data-server")]
#[command(version = "0.1.0")]
#[command(about = "A WebRTC data-channel endpoint behind an HTTP signalling surface", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Public IPv4 advertised as the srflx candidate; defaults to the
    /// internal address.
    #[arg(long)]
    public_ip: Option<Ipv4Addr>,
    /// PEM certificate; a self-signed one is generated when omitted.
    #[arg(long)]
    cert: Option<PathBuf>,
    /// PEM private key matching --cert.
    #[arg(long)]
    key: Option<PathBuf>,
}

fn identity(cli: &Cli) -> Result<(Vec<u8>, Vec<u8>)> {
    if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
        return Ok((std::fs::read(cert)?, std::fs::read(key)?));
    }

    info!("no identity configured, generating a self-signed certificate");
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let cert = rcgen::CertificateParams::new(vec!["data-server".to_owned()])?
        .self_signed(&key_pair)?;
    Ok((
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    if cli.debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    } else {
        env_logger::Builder::new().filter(None, log_level).init();
    }

    let (stop_tx, stop_rx) = broadcast::channel::<()>(1);

    info!("Press Ctrl-C to stop");
    std::thread::spawn(move || {
        let mut stop_tx = Some(stop_tx);
        ctrlc::set_handler(move || {
            if let Some(stop_tx) = stop_tx.take() {
                let _ = stop_tx.send(());
            }
        })
        .expect("Error setting Ctrl-C handler");
    });

    if let Err(err) = run(cli, stop_rx).await {
        error!("run got error: {err}");
    }

    Ok(())
}

async fn run(cli: Cli, mut stop_rx: broadcast::Receiver<()>) -> Result<()> {
    let (certificate_pem, private_key_pem) = identity(&cli)?;

    let (endpoint, mut events) = Endpoint::new(
        EndpointConfig {
            certificate_pem,
            private_key_pem,
        },
        Transports {
            discovery: Arc::new(SystemDiscovery {
                public_override: cli.public_ip,
            }),
            dtls: Arc::new(stub::StubDtls),
            sctp: Arc::new(stub::StubSctp),
        },
    )?;
    endpoint.start().await?;
    info!("endpoint fingerprint {}", endpoint.fingerprint());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::ChannelOpen {
                    session,
                    mut channel,
                } => {
                    info!(
                        "session {session}: data channel open on stream {}",
                        channel.stream_id()
                    );
                    tokio::spawn(async move {
                        while let Some(data) = channel.recv().await {
                            info!(
                                "session {session}: {} bytes on stream {}",
                                data.len(),
                                channel.stream_id()
                            );
                        }
                    });
                }
                event => info!("{event:?}"),
            }
        }
    });

    let signalling = Signalling::new(endpoint);
    let addr = SocketAddr::from_str(&format!("{}:{}", cli.host, cli.port))?;
    let make_svc = make_service_fn(move |_| {
        let signalling = signalling.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                remote_handler(req, signalling.clone())
            }))
        }
    });

    info!("signalling on http://{addr}");
    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = stop_rx.recv().await;
        });
    server.await?;

    Ok(())
}

/// Binds the three signalling operations to their HTTP routes.
async fn remote_handler(
    req: Request<Body>,
    signalling: Signalling,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    match (method, path.as_str()) {
        (Method::POST, "/offer") => {
            let body = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<OfferBody>(&body) {
                Ok(offer) => match signalling.offer(offer).await {
                    Ok(answer) => Ok(json_response(&answer)),
                    Err(err) => Ok(error_response(err)),
                },
                Err(err) => Ok(bad_request(format!("bad offer body: {err}"))),
            }
        }
        (Method::POST, "/candidate") => {
            let body = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<CandidateBody>(&body) {
                Ok(candidate) => match signalling.candidate(candidate).await {
                    Ok(()) => Ok(Response::new(Body::empty())),
                    Err(err) => Ok(error_response(err)),
                },
                Err(err) => Ok(bad_request(format!("bad candidate body: {err}"))),
            }
        }
        (Method::GET, path) if path.starts_with("/candidates/") => {
            let username = &path["/candidates/".len()..];
            match signalling.candidates(username).await {
                Ok(entries) => Ok(json_response(&entries)),
                Err(err) => Ok(error_response(err)),
            }
        }
        _ => {
            let mut response = Response::new(Body::from("Not Found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(json) => Response::builder()
            .header("content-type", "application/json; charset=utf-8")
            .body(Body::from(json))
            .unwrap_or_default(),
        Err(err) => {
            warn!("response serialisation failed: {err}");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn bad_request(message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

fn error_response(err: Error) -> Response<Body> {
    let status = match err {
        Error::SignallingBadRequest(_) | Error::InvalidOffer(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("signalling request failed: {err}");
    let mut response = Response::new(Body::from(err.to_string()));
    *response.status_mut() = status;
    response
}
