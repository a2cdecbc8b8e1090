//! The Response Manager: a process-wide singleton that listens on one TCP port, performs
//! RSA+AES hybrid decryption of launcher payloads, and routes each decrypted connection
//! record to the registrant keyed by kernel id.
//!
//! Unlike the system this is modeled on, there is no hidden global here: `ResponseManager`
//! is constructed once at process startup and handed to every provisioner that needs it.

#![forbid(unsafe_code)]

pub mod crypto;

use anyhow::{Context, Result};
use kprov_core::types::KernelId;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

struct Slot {
    value: Mutex<Option<Value>>,
    /// Sticks at `true` once a value has been read out, so a payload arriving after
    /// delivery is recognized as a duplicate even though `value` itself reads empty again.
    delivered: AtomicBool,
    notify: Notify,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Slot { value: Mutex::new(None), delivered: AtomicBool::new(false), notify: Notify::new() })
    }
}

pub struct ResponseManager {
    priv_key: RsaPrivateKey,
    pub_key_b64: String,
    local_addr: std::net::SocketAddr,
    registry: Mutex<HashMap<KernelId, Arc<Slot>>>,
    v0_warned: std::sync::atomic::AtomicBool,
}

fn is_retryable_bind_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied)
}

impl ResponseManager {
    /// Binds the listener (retrying across `retries` subsequent ports, skipping
    /// EADDRINUSE/EACCES per §4.B) and spawns the background accept loop. Returns an `Arc`
    /// since the manager is shared across every provisioner in the process.
    pub async fn bind(response_ip: &str, base_port: u16, retries: u16) -> Result<Arc<Self>> {
        let (priv_key, pub_key) = crypto::generate_keypair()?;
        let pub_key_b64 = crypto::public_key_b64(&pub_key)?;

        let mut last_err: Option<io::Error> = None;
        for attempt in 0..=retries {
            let port = base_port.wrapping_add(attempt);
            match TcpListener::bind((response_ip, port)).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr().context("reading bound local address")?;
                    info!(response_ip, port, "response manager bound");
                    let me = Arc::new(ResponseManager {
                        priv_key,
                        pub_key_b64,
                        local_addr,
                        registry: Mutex::new(HashMap::new()),
                        v0_warned: std::sync::atomic::AtomicBool::new(false),
                    });
                    Arc::clone(&me).spawn_accept_loop(listener);
                    return Ok(me);
                }
                Err(e) if is_retryable_bind_error(&e) => {
                    debug!(port, error = %e, "bind failed, trying next port");
                    last_err = Some(e);
                }
                Err(e) => return Err(e).context("binding response manager listener"),
            }
        }
        Err(anyhow::anyhow!(
            "exhausted {retries} port retries binding response manager starting at {base_port}: {:?}",
            last_err
        ))
    }

    pub fn public_key_b64(&self) -> &str {
        &self.pub_key_b64
    }

    pub fn response_address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Installs a set-once slot for `kernel_id`. Must be called before the launcher can
    /// post a payload for it (§4.D step 1).
    pub async fn register_event(&self, kernel_id: &KernelId) {
        self.registry.lock().await.insert(kernel_id.clone(), Slot::new());
    }

    /// Releases a registration without delivering a value, used when `confirm_remote_startup`
    /// is cancelled so the Response Manager doesn't leak registrations (§5 cancellation
    /// semantics).
    pub async fn unregister(&self, kernel_id: &KernelId) {
        self.registry.lock().await.remove(kernel_id);
    }

    /// Awaits delivery with an internal timeout; returns `None` on timeout so the caller's
    /// poll loop can iterate (M3).
    pub async fn get_connection_info(&self, kernel_id: &KernelId, timeout: Duration) -> Option<Value> {
        let slot = self.registry.lock().await.get(kernel_id).cloned()?;
        {
            let mut guard = slot.value.lock().await;
            if let Some(v) = guard.take() {
                slot.delivered.store(true, Ordering::Release);
                return Some(v);
            }
        }
        let _ = tokio::time::timeout(timeout, slot.notify.notified()).await;
        let mut guard = slot.value.lock().await;
        let v = guard.take();
        if v.is_some() {
            slot.delivered.store(true, Ordering::Release);
        }
        v
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, peer)) => {
                        let me = Arc::clone(&self);
                        tokio::spawn(async move {
                            let mut buf = Vec::new();
                            match tokio::time::timeout(
                                Duration::from_secs(5),
                                stream.take(MAX_PAYLOAD_BYTES as u64).read_to_end(&mut buf),
                            )
                            .await
                            {
                                Ok(Ok(_)) => me.process_payload(&buf).await,
                                Ok(Err(e)) => warn!(%peer, error = %e, "reading launcher payload failed"),
                                Err(_) => warn!(%peer, "timed out reading launcher payload"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "response manager accept failed");
                    }
                }
            }
        });
    }

    async fn process_payload(&self, raw: &[u8]) {
        let trimmed: &[u8] = {
            let end = raw.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(0);
            &raw[..end]
        };

        match crypto::try_decode_v1(&self.priv_key, trimmed) {
            Ok(Some(value)) => {
                self.post_connection(value).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "v1 payload decode failed, falling back to legacy v0");
            }
        }

        let registered: Vec<KernelId> = self.registry.lock().await.keys().cloned().collect();
        for kernel_id in registered {
            if let Some(mut value) = crypto::try_decode_v0_with_kernel_id(trimmed, &kernel_id) {
                if !self.v0_warned.swap(true, std::sync::atomic::Ordering::Relaxed) {
                    warn!("accepted a legacy (unversioned) connection payload; v0 support is deprecated");
                }
                if let Value::Object(ref mut map) = value {
                    map.insert("kernel_id".to_string(), Value::String(kernel_id.clone()));
                }
                self.post_connection(value).await;
                return;
            }
        }

        error!("unable to decode launcher payload via v1 or legacy v0");
    }

    async fn post_connection(&self, value: Value) {
        let kernel_id = match value.get("kernel_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                error!("decoded payload is missing kernel_id, dropping");
                return;
            }
        };
        let slot = {
            let registry = self.registry.lock().await;
            registry.get(&kernel_id).cloned()
        };
        let Some(slot) = slot else {
            error!(kernel_id, "payload for unregistered kernel_id, dropping");
            return;
        };
        if slot.delivered.load(Ordering::Acquire) {
            warn!(kernel_id, "duplicate connection payload after first delivery, dropping");
            return;
        }
        let mut guard = slot.value.lock().await;
        if guard.is_some() {
            warn!(kernel_id, "duplicate connection payload before first delivery, dropping");
            return;
        }
        *guard = Some(value);
        drop(guard);
        slot.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn connect_and_send(addr: std::net::SocketAddr, payload: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delivers_v1_payload_to_registrant_m1() {
        let manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let kernel_id = "kernel-m1".to_string();
        manager.register_event(&kernel_id).await;

        let pub_key = RsaPublicKey::from(&manager.priv_key);
        let aes_key = *b"0123456789abcdef";
        let conn_info = json!({"shell_port": 10, "kernel_id": kernel_id});
        let wire = crypto::encode_v1(&pub_key, &aes_key, &conn_info).unwrap();

        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", manager.local_addr.port()).parse().unwrap();
        connect_and_send(addr, &wire).await;

        let got = manager
            .get_connection_info(&kernel_id, Duration::from_secs(2))
            .await
            .expect("connection info delivered");
        assert_eq!(got, conn_info);
    }

    #[tokio::test]
    async fn second_payload_after_delivery_is_dropped_m2() {
        let manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let kernel_id = "kernel-m2".to_string();
        manager.register_event(&kernel_id).await;

        let pub_key = RsaPublicKey::from(&manager.priv_key);
        let aes_key = *b"0123456789abcdef";
        let first = json!({"shell_port": 1, "kernel_id": kernel_id});
        let second = json!({"shell_port": 2, "kernel_id": kernel_id});

        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", manager.local_addr.port()).parse().unwrap();
        connect_and_send(addr, &crypto::encode_v1(&pub_key, &aes_key, &first).unwrap()).await;
        let got = manager.get_connection_info(&kernel_id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, first);

        connect_and_send(addr, &crypto::encode_v1(&pub_key, &aes_key, &second).unwrap()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let got2 = manager.get_connection_info(&kernel_id, Duration::from_millis(50)).await;
        assert!(got2.is_none(), "second payload should have been dropped, not queued");
    }

    #[tokio::test]
    async fn unregistered_kernel_times_out_m3() {
        let manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let got = manager.get_connection_info(&"no-such-kernel".to_string(), Duration::from_millis(20)).await;
        assert!(got.is_none());
    }
}
