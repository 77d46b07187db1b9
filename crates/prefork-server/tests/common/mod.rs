#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prefork_server::{EchoProcessor, PipelineFactories, Server};
use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type Client = Framed<TcpStream, LengthDelimitedCodec>;

/// An echo server bound to an ephemeral loopback port.
pub fn echo_server(workers: usize) -> io::Result<(Arc<Server>, TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = Server::new(
        addr.to_string(),
        PipelineFactories::default(),
        Arc::new(EchoProcessor),
    );
    server
        .set_worker_count(workers)
        .map_err(io::Error::other)?;
    Ok((Arc::new(server), listener, addr))
}

pub fn serve_in_background(
    server: &Arc<Server>,
    listener: TcpListener,
) -> thread::JoinHandle<prefork_core::Result<i32>> {
    let server = server.clone();
    thread::spawn(move || server.serve(Some(listener)))
}

pub fn runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

pub async fn connect(addr: SocketAddr) -> io::Result<Client> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(Framed::new(stream, LengthDelimitedCodec::new())),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

pub async fn round_trip(client: &mut Client, payload: &'static [u8]) -> io::Result<Bytes> {
    client.send(Bytes::from_static(payload)).await?;
    let reply = client
        .next()
        .await
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;
    Ok(reply.freeze())
}

/// Polls until nothing accepts connections on `addr`.
pub async fn wait_until_refused(addr: SocketAddr) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match TcpStream::connect(addr).await {
            Err(_) => return true,
            Ok(stream) => {
                drop(stream);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    false
}
