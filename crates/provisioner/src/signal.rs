//! Comm-port signal delivery: one TCP connection per signal, matching §4.D / §6.

use anyhow::{Context, Result};
use serde_json::json;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;
pub const SIGUSR2: i32 = 12;

/// Sends `{"signum": signum}` to the launcher's comm port and closes. Any error other than
/// connection-refused is treated as "not delivered" rather than propagated, so the caller
/// falls back to a backend-native signal.
pub async fn send_via_comm_port(comm_ip: &str, comm_port: u16, signum: i32, socket_timeout: Duration) -> Result<bool> {
    let addr = format!("{comm_ip}:{comm_port}");
    let connect = tokio::time::timeout(socket_timeout, TcpStream::connect(&addr)).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(addr, "comm port connection refused");
            return Ok(false);
        }
        Ok(Err(e)) => return Err(e).context("connecting to comm port"),
        Err(_) => return Ok(false),
    };
    let payload = json!({ "signum": signum }).to_string();
    stream.write_all(payload.as_bytes()).await.context("writing signal payload")?;
    stream.shutdown().await.context("half-closing comm port connection")?;
    Ok(true)
}

/// Sends `{"shutdown": 1}`. ECONNREFUSED/ENOTCONN are swallowed per §4.D — shutdown is
/// best-effort and idempotent.
pub async fn send_shutdown(comm_ip: &str, comm_port: u16, socket_timeout: Duration) -> Result<()> {
    let addr = format!("{comm_ip}:{comm_port}");
    let connect = tokio::time::timeout(socket_timeout, TcpStream::connect(&addr)).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected) => return Ok(()),
        Ok(Err(e)) => return Err(e).context("connecting to comm port for shutdown"),
        Err(_) => return Ok(()),
    };
    let payload = json!({ "shutdown": 1 }).to_string();
    if let Err(e) = stream.write_all(payload.as_bytes()).await {
        if !matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected) {
            return Err(e).context("writing shutdown payload");
        }
        return Ok(());
    }
    let _ = stream.shutdown().await;
    Ok(())
}

/// Whether a requested signal additionally needs the Spark SIGUSR2 companion: SIGINT
/// delivered to a Spark-flavored placement also interrupts the running Spark job.
pub fn needs_spark_sigusr2(signum: i32, is_spark: bool) -> bool {
    signum == SIGINT && is_spark
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spark_sigusr2_only_for_sigint_on_spark() {
        assert!(needs_spark_sigusr2(SIGINT, true));
        assert!(!needs_spark_sigusr2(SIGINT, false));
        assert!(!needs_spark_sigusr2(9, true));
    }

    #[tokio::test]
    async fn send_via_comm_port_returns_false_when_refused() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let delivered = send_via_comm_port("127.0.0.1", port, 0, Duration::from_millis(200)).await.unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn send_via_comm_port_delivers_to_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            use tokio::io::AsyncReadExt;
            sock.read_to_end(&mut buf).await.unwrap();
            buf
        });
        let delivered = send_via_comm_port("127.0.0.1", port, 0, Duration::from_secs(1)).await.unwrap();
        assert!(delivered);
        let received = server.await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(value["signum"], 0);
    }
}
