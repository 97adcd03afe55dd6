/// http surfaces served by every worker process.
///
/// * the cache-aside service: `GET /data`, `GET /data/:key`, `GET /stats`
/// * the probe service: any path answers with the worker's pid
///
use log::*;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use tide::{Body, Request, Response, StatusCode};

use crate::cache::ReadThrough;
use crate::error::CacheError;

/// the only body a client sees when a request fails
pub const INTERNAL_ERROR: &str = "internal server error";

const LISTEN_BACKLOG: i32 = 1024;

/// bind a listener that other processes can bind too (SO_REUSEPORT on unix)
pub fn shared_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[derive(Clone)]
pub struct DataState {
    cache: ReadThrough,
    default_key: String,
}

/// the cache-aside service
pub fn data_app(cache: ReadThrough, default_key: &str) -> tide::Server<DataState> {
    let mut app = tide::with_state(DataState {
        cache,
        default_key: default_key.to_string(),
    });

    app.at("/data").get(get_default);
    app.at("/data/:key").get(get_key);
    app.at("/stats").get(get_stats);

    app
}

async fn get_default(req: Request<DataState>) -> tide::Result {
    let state = req.state();
    Ok(read_through(state, &state.default_key).await)
}

async fn get_key(req: Request<DataState>) -> tide::Result {
    let key = req.param("key")?;
    Ok(read_through(req.state(), key).await)
}

async fn get_stats(req: Request<DataState>) -> tide::Result {
    let stats = req.state().cache.stats();
    Ok(Response::builder(StatusCode::Ok)
        .body(Body::from_json(&stats)?)
        .build())
}

async fn read_through(state: &DataState, key: &str) -> Response {
    match state.cache.get(key).await {
        Ok(value) => Response::builder(StatusCode::Ok).body(value).build(),
        Err(CacheError::InvalidKey) => Response::builder(StatusCode::BadRequest)
            .body(CacheError::InvalidKey.to_string())
            .build(),
        Err(e) => {
            error!("request for key: {} failed: {}", key, e);
            Response::builder(StatusCode::InternalServerError)
                .body(INTERNAL_ERROR)
                .build()
        }
    }
}

/// the probe service; the state is the pid reported in every greeting
pub fn probe_app(pid: u32) -> tide::Server<u32> {
    let mut app = tide::with_state(pid);
    app.at("/").all(greet);
    app.at("/*path").all(greet);
    app
}

pub fn greeting(pid: u32) -> String {
    format!("Hello, World! from worker {}", pid)
}

async fn greet(req: Request<u32>) -> tide::Result {
    Ok(Response::builder(StatusCode::Ok)
        .body(greeting(*req.state()))
        .build())
}
