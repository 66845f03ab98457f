//! Runs the TCP and UDP proxies until shutdown.

use crate::cli::Args;
use anyhow::Context;
use prox_core::{
    transports::{Tcp, Udp},
    Selector, Shutdown, ShutdownSignal, Transport, TransportProxy,
};
use std::{future::Future, time::Duration};
use tokio::time::{interval, MissedTickBehavior};

/// Both proxies, started on one selector.
pub struct Relay {
    selector: Selector,
    tcp: TransportProxy<Tcp>,
    udp: TransportProxy<Udp>,
}

impl Relay {
    /// Builds both proxies from `args` and starts them on `selector`.
    pub fn start(args: &Args, selector: Selector) -> anyhow::Result<Self> {
        let tcp_transport = match args.tcp_forward {
            Some(target) => Tcp::forwarding(target),
            None => Tcp::new(),
        };
        let udp_transport = match args.udp_forward {
            Some(target) => Udp::forwarding(target),
            None => Udp::new(),
        };
        let tcp = TransportProxy::new(tcp_transport, args.tcp_config());
        let udp = TransportProxy::new(udp_transport, args.udp_config());

        tcp.start(&selector)
            .with_context(|| format!("failed to start the TCP proxy on {}", args.tcp_bind))?;
        if let Err(e) = udp.start(&selector) {
            let _ = tcp.close();
            return Err(e)
                .with_context(|| format!("failed to start the UDP proxy on {}", args.udp_bind));
        }

        Ok(Self { selector, tcp, udp })
    }

    pub fn tcp(&self) -> &TransportProxy<Tcp> {
        &self.tcp
    }

    pub fn udp(&self) -> &TransportProxy<Udp> {
        &self.udp
    }

    /// Sweeps idle sessions every `every` until `shutdown` resolves, then
    /// closes both proxies and the selector.
    pub async fn run(
        self,
        every: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let stop = Shutdown::new();
        let sweeper = tokio::spawn(sweep(
            self.tcp.clone(),
            self.udp.clone(),
            every,
            stop.subscribe(),
        ));

        shutdown.await;
        tracing::info!("Shutting down");

        stop.shut_down();
        let _ = sweeper.await;
        let tcp = self.tcp.close().context("failed to close the TCP proxy");
        let udp = self.udp.close().context("failed to close the UDP proxy");
        self.selector.shut_down();
        tcp.and(udp)
    }
}

async fn sweep(
    tcp: TransportProxy<Tcp>,
    udp: TransportProxy<Udp>,
    every: Duration,
    mut stop: ShutdownSignal,
) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticks.tick().await;
    loop {
        tokio::select! {
            _ = stop.wait_for_shutdown() => break,
            _ = ticks.tick() => {
                sweep_one(&tcp);
                sweep_one(&udp);
            }
        }
    }
}

fn sweep_one<T: Transport>(proxy: &TransportProxy<T>) {
    let reclaimed = proxy.sweep_idle();
    if reclaimed > 0 {
        tracing::debug!(
            transport = T::NAME,
            reclaimed,
            remaining = proxy.session_count(),
            "Reclaimed idle sessions"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream, UdpSocket},
    };
    use tracing_test::traced_test;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn relays_until_shutdown() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let target = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            }
        });

        let args = Args::try_parse_from(["prox", "--tcp-forward", target.to_string().as_str()])?;
        let relay = Relay::start(&args, Selector::current())?;
        let tcp_addr = relay.tcp().local_addr().unwrap();
        let udp_addr = relay.udp().local_addr().unwrap();
        assert!(relay.tcp().is_running());
        assert!(relay.udp().is_running());

        let mut client = TcpStream::connect(tcp_addr).await?;
        client.write_all(b"Hello!").await?;
        let mut buf = [0; 6];
        client.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"Hello!");

        let tcp = relay.tcp().clone();
        let udp = relay.udp().clone();
        relay
            .run(Duration::from_secs(1), std::future::ready(()))
            .await?;
        assert!(logs_contain("Shutting down"));

        assert!(!tcp.is_running());
        assert!(!udp.is_running());
        assert_eq!(tcp.session_count(), 0);
        // The UDP port is released once the receive loop is dropped.
        let mut rebound = false;
        for _ in 0..100 {
            if UdpSocket::bind(udp_addr).await.is_ok() {
                rebound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rebound, "the UDP port is still bound");
        Ok(())
    }

    #[tokio::test]
    async fn start_fails_on_a_taken_port() -> anyhow::Result<()> {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let args = Args::try_parse_from([
            "prox",
            "--udp-bind",
            taken.local_addr()?.to_string().as_str(),
        ])?;

        let error = Relay::start(&args, Selector::current())
            .err()
            .expect("the UDP port is taken");
        assert!(error.to_string().contains("UDP"));
        Ok(())
    }
}
