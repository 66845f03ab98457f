use prox_core::{
    transports::Tcp, ProxyConfig, Selector, Session, TransportProxy,
};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::timeout,
};

mod support;
use support::{eventually, tcp_echo_server, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_unregistered_connections() -> anyhow::Result<()> {
    let echo = tcp_echo_server().await?;
    let selector = Selector::current();
    let proxy = TransportProxy::new(Tcp::forwarding(echo), ProxyConfig::default());
    proxy.start(&selector)?;
    assert!(proxy.is_running());

    let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await?;
    let source_port = client.local_addr()?.port();
    client.write_all(b"Hello!").await?;
    let mut buf = [0; 6];
    timeout(WAIT, client.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"Hello!");

    let session = proxy.get_session(source_port).expect("no session for the client");
    assert_eq!(session.remote_addr(), echo);
    assert!(session.is_relaying());

    drop(client);
    eventually("the session to be released", || proxy.session_count() == 0).await;
    assert!(session.is_finished());

    proxy.close()?;
    assert!(!proxy.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_registered_flows() -> anyhow::Result<()> {
    let echo = tcp_echo_server().await?;
    let selector = Selector::current();
    let proxy = TransportProxy::new(Tcp::new(), ProxyConfig::default());
    proxy.start(&selector)?;

    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;
    let source_port = socket.local_addr()?.port();
    let session = proxy.pick_session(source_port, echo)?;
    assert!(!session.is_relaying());

    let mut client = socket.connect(proxy.local_addr().unwrap()).await?;
    client.write_all(b"ping").await?;
    let mut buf = [0; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"ping");

    let finished = proxy.finish_session(source_port).expect("session vanished");
    assert!(finished.is_finished());
    assert!(!finished.is_relaying());
    assert!(proxy.get_session(source_port).is_none());

    // Closing the session tears the client connection down.
    let mut rest = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut rest)).await?;
    assert!(read.map_or(true, |len| len == 0));

    proxy.close()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drops_unknown_connections() -> anyhow::Result<()> {
    let selector = Selector::current();
    let proxy = TransportProxy::new(Tcp::new(), ProxyConfig::default());
    proxy.start(&selector)?;

    let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await?;
    let mut buf = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut buf)).await?;
    assert!(read.map_or(true, |len| len == 0));
    assert_eq!(proxy.session_count(), 0);

    proxy.close()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_stops_the_listener() -> anyhow::Result<()> {
    let echo = tcp_echo_server().await?;
    let selector = Selector::current();
    let proxy = TransportProxy::new(Tcp::forwarding(echo), ProxyConfig::default());
    proxy.start(&selector)?;
    let addr = proxy.local_addr().unwrap();
    assert_eq!(selector.registered(), 1);

    proxy.close()?;

    eventually("the accept loop to stop", || selector.registered() == 0).await;
    eventually("the port to be released", || {
        std::net::TcpStream::connect(addr).is_err()
    })
    .await;
    Ok(())
}

#[tokio::test]
async fn bind_conflict_fails_start() -> anyhow::Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let selector = Selector::current();
    let proxy = TransportProxy::new(
        Tcp::new(),
        ProxyConfig::new(taken.local_addr()?),
    );

    assert!(proxy.start(&selector).is_err());
    assert!(!proxy.is_running());
    Ok(())
}
